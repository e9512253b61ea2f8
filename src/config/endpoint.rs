//! Control plane endpoint validation

use crate::{Error, Result, DEFAULT_KUBERNETES_API_PORT};

/// Validate a control plane endpoint
///
/// The endpoint must use `https` and name its port explicitly. On failure the
/// error suggests the corrected form using the default API server port.
pub fn validate_endpoint(endpoint: &str) -> Result<url::Url> {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return Err(Error::validation("cluster endpoint must not be empty"));
    }

    let reject = |reason: &str| {
        Error::validation(format!(
            "invalid cluster endpoint {trimmed:?}: {reason}, try \"https://{}:{}\"",
            suggested_host(trimmed),
            DEFAULT_KUBERNETES_API_PORT
        ))
    };

    let parsed = url::Url::parse(trimmed).map_err(|_| reject("not a URL"))?;
    if parsed.scheme() != "https" {
        return Err(reject("scheme must be https"));
    }
    if parsed.host_str().filter(|host| !host.is_empty()).is_none() {
        return Err(reject("missing host"));
    }

    // `Url::port` hides default ports, so look at the authority text itself.
    if explicit_port(authority(trimmed)).is_none() {
        return Err(reject("port must be explicit"));
    }

    Ok(parsed)
}

fn authority(endpoint: &str) -> &str {
    let rest = endpoint.split_once("://").map_or(endpoint, |(_, rest)| rest);
    let rest = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    rest.rsplit_once('@').map_or(rest, |(_, host)| host)
}

fn explicit_port(authority: &str) -> Option<&str> {
    let port = if authority.starts_with('[') {
        authority.split_once(']')?.1.strip_prefix(':')?
    } else {
        authority.rsplit_once(':')?.1
    };
    (!port.is_empty() && port.bytes().all(|b| b.is_ascii_digit())).then_some(port)
}

fn suggested_host(endpoint: &str) -> &str {
    let authority = authority(endpoint);
    if authority.starts_with('[') {
        return authority
            .split_once(']')
            .map_or(authority, |(host, _)| &authority[..=host.len()]);
    }
    match authority.rsplit_once(':') {
        Some((host, _)) if !host.is_empty() => host,
        _ => authority,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_https_with_port() {
        let url = validate_endpoint("https://10.5.0.2:6443").unwrap();
        assert_eq!(url.host_str(), Some("10.5.0.2"));
        assert!(validate_endpoint("https://api.example.com:443").is_ok());
        assert!(validate_endpoint("https://[fd00::1]:6443").is_ok());
    }

    #[test]
    fn bare_host_suggests_default_port() {
        let err = validate_endpoint("cluster.local").unwrap_err();
        assert!(
            err.to_string().contains("\"https://cluster.local:6443\""),
            "{err}"
        );
    }

    #[test]
    fn missing_port_suggests_default_port() {
        let err = validate_endpoint("https://cluster.local").unwrap_err();
        assert!(err.to_string().contains("https://cluster.local:6443"), "{err}");
    }

    #[test]
    fn wrong_scheme_is_rejected() {
        let err = validate_endpoint("http://cluster.local:6443").unwrap_err();
        assert!(err.to_string().contains("https://cluster.local:6443"), "{err}");

        let err = validate_endpoint("cluster.local:6443").unwrap_err();
        assert!(err.to_string().contains("https://cluster.local:6443"), "{err}");
    }

    #[test]
    fn empty_endpoint_is_rejected() {
        assert!(validate_endpoint("  ").is_err());
    }

    #[test]
    fn ipv6_suggestion_keeps_brackets() {
        let err = validate_endpoint("https://[fd00::1]").unwrap_err();
        assert!(err.to_string().contains("https://[fd00::1]:6443"), "{err}");
    }
}
