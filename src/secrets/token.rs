//! Random secret material
//!
//! Tokens and encryption secrets are drawn from aws-lc-rs's FIPS random source.

use base64::{engine::general_purpose::STANDARD, Engine};

use super::PkiError;

const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Fill `len` bytes from the system random source
pub fn random_bytes(len: usize) -> Result<Vec<u8>, PkiError> {
    let mut raw = vec![0u8; len];
    aws_lc_rs::rand::fill(&mut raw)
        .map_err(|_| PkiError::RandomGenerationFailed("random generation failed".to_string()))?;
    Ok(raw)
}

/// 32 random bytes, base64 encoded (cluster id/secret, encryption secrets)
pub fn random_secret() -> Result<String, PkiError> {
    Ok(STANDARD.encode(random_bytes(32)?))
}

/// Kubernetes-style token `[a-z0-9]{6}.[a-z0-9]{16}`
pub fn generate_token() -> Result<String, PkiError> {
    let raw = random_bytes(22)?;
    let chars: String = raw
        .iter()
        .map(|b| TOKEN_ALPHABET[*b as usize % TOKEN_ALPHABET.len()] as char)
        .collect();
    Ok(format!("{}.{}", &chars[..6], &chars[6..]))
}

/// Returns true if `token` has the `[a-z0-9]{6}.[a-z0-9]{16}` shape
pub fn is_valid_token(token: &str) -> bool {
    let Some((id, secret)) = token.split_once('.') else {
        return false;
    };
    let valid =
        |s: &str, len: usize| s.len() == len && s.bytes().all(|b| TOKEN_ALPHABET.contains(&b));
    valid(id, 6) && valid(secret, 16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_has_kubernetes_shape() {
        for _ in 0..32 {
            let token = generate_token().unwrap();
            assert!(is_valid_token(&token), "{token}");
        }
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(generate_token().unwrap(), generate_token().unwrap());
    }

    #[test]
    fn secret_decodes_to_32_bytes() {
        let secret = random_secret().unwrap();
        assert_eq!(STANDARD.decode(secret).unwrap().len(), 32);
    }

    #[test]
    fn malformed_tokens_rejected() {
        assert!(!is_valid_token("abcdef"));
        assert!(!is_valid_token("ABCDEF.0123456789abcdef"));
        assert!(!is_valid_token("abcde.0123456789abcdef"));
        assert!(!is_valid_token("abcdef.0123456789abcde"));
    }
}
