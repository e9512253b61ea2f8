//! Machine configuration
//!
//! - [`types`]: the `v1alpha1` schema
//! - [`generate`]: base documents per machine type, gated by the contract
//! - [`compile`]: the full request pipeline (validate, generate, patch, encode)
//! - [`encode`]: annotated YAML output

mod compiler;
mod docs;
mod encoder;
mod endpoint;
pub mod generate;
pub mod types;

pub use compiler::{compile, CompiledConfig, GenerationDefaults, MachineConfigGenerationRequest};
pub use encoder::{encode, EncoderOptions};
pub use endpoint::validate_endpoint;
pub use types::{MachineConfig, MachineType, CONFIG_VERSION};

use crate::{Error, Result};

/// Parse a rendered machine configuration
///
/// Comments are ignored. Unknown keys are rejected the same way strict
/// patches reject them.
pub fn parse_document(text: &str) -> Result<MachineConfig> {
    let invalid = |msg: String| Error::parse("machine configuration", msg);

    let value: serde_json::Value =
        serde_yaml::from_str(text).map_err(|e| invalid(e.to_string()))?;
    let (config, unknown) = crate::patch::from_value_tracking::<MachineConfig>(value)
        .map_err(|e| invalid(e.to_string()))?;

    if !unknown.is_empty() {
        return Err(invalid(format!("unknown keys: {}", unknown.join(", "))));
    }

    if config.version != CONFIG_VERSION {
        return Err(invalid(format!("unsupported version {:?}", config.version)));
    }

    Ok(config)
}
