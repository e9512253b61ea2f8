//! Configuration patches
//!
//! Patches come in two shapes:
//!
//! - **strategic merge**: a partial document merged onto the target. Maps merge
//!   recursively, lists append, scalars replace, and `$patch: delete` removes a
//!   key;
//! - **JSON-6902**: a list of addressed operations (`add`, `remove`,
//!   `replace`, `move`, `copy`, `test`).
//!
//! Patches are applied strictly in list order, each to the cumulative result of
//! the ones before it. In [`PatchMode::Strict`] any key the target schema can't
//! represent is an error listing every offending key path.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{Error, Result};

const DELETE_DIRECTIVE_KEY: &str = "$patch";
const DELETE_DIRECTIVE_VALUE: &str = "delete";

/// Where a patch came from, before parsing
#[derive(Clone, Debug, PartialEq)]
pub enum PatchSource {
    /// Already-structured fragment (map for strategic merge, list for JSON-6902)
    Inline(Value),
    /// YAML or JSON text, possibly holding several documents
    Raw(String),
}

impl From<Value> for PatchSource {
    fn from(value: Value) -> Self {
        Self::Inline(value)
    }
}

impl From<&str> for PatchSource {
    fn from(text: &str) -> Self {
        Self::Raw(text.to_string())
    }
}

impl From<String> for PatchSource {
    fn from(text: String) -> Self {
        Self::Raw(text)
    }
}

/// A parsed patch
#[derive(Clone, Debug)]
pub enum Patch {
    /// Partial document merged onto the target
    StrategicMerge(Value),
    /// Addressed operations
    Json6902(json_patch::Patch),
}

/// How unknown keys are treated when applying patches
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PatchMode {
    /// Unknown keys are a validation error
    #[default]
    Strict,
    /// Unknown keys are dropped
    Lenient,
}

/// Parse patch sources into patches, preserving order
///
/// Fails on the first source that is neither a strategic merge document nor
/// an operation list.
pub fn load_patches(sources: &[PatchSource]) -> Result<Vec<Patch>> {
    let mut patches = Vec::with_capacity(sources.len());

    for (index, source) in sources.iter().enumerate() {
        let what = format!("patch #{}", index + 1);
        match source {
            PatchSource::Inline(value) => patches.push(classify(&what, value.clone())?),
            PatchSource::Raw(text) => {
                let before = patches.len();
                for document in serde_yaml::Deserializer::from_str(text) {
                    let value = Value::deserialize(document)
                        .map_err(|e| Error::parse(what.clone(), e.to_string()))?;
                    if value.is_null() {
                        continue;
                    }
                    patches.push(classify(&what, value)?);
                }
                if patches.len() == before {
                    return Err(Error::parse(what, "patch is empty"));
                }
            }
        }
    }

    debug!(count = patches.len(), "Loaded patches");
    Ok(patches)
}

fn classify(what: &str, value: Value) -> Result<Patch> {
    match value {
        Value::Object(_) => Ok(Patch::StrategicMerge(value)),
        Value::Array(_) => serde_json::from_value::<json_patch::Patch>(value)
            .map(Patch::Json6902)
            .map_err(|e| Error::parse(what, format!("invalid JSON patch operations: {e}"))),
        other => Err(Error::parse(
            what,
            format!(
                "expected a strategic merge document or a list of JSON patch operations, got {}",
                type_name(&other)
            ),
        )),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a map",
    }
}

/// Apply `patches` in order to `base` and re-read the result into `T`
pub fn apply<T>(base: &T, patches: &[Patch], mode: PatchMode) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let mut document = serde_json::to_value(base)?;

    for (index, patch) in patches.iter().enumerate() {
        apply_to_value(&mut document, patch)
            .map_err(|e| Error::validation(format!("patch #{} failed: {e}", index + 1)))?;
    }

    let (typed, unknown) = from_value_tracking::<T>(document)
        .map_err(|e| Error::validation(format!("patched document is invalid: {e}")))?;

    if mode == PatchMode::Strict && !unknown.is_empty() {
        return Err(Error::validation(format!(
            "unknown keys found in patches: {}",
            unknown.join(", ")
        )));
    }

    Ok(typed)
}

/// Read `document` into `T`, collecting the dotted path of every key `T`
/// has no field for, whatever its value
pub fn from_value_tracking<T: DeserializeOwned>(
    document: Value,
) -> std::result::Result<(T, Vec<String>), serde_json::Error> {
    let mut unknown = Vec::new();
    let typed = serde_ignored::deserialize(document, |path| unknown.push(dotted(&path)))?;
    Ok((typed, unknown))
}

fn dotted(path: &serde_ignored::Path<'_>) -> String {
    use serde_ignored::Path;

    match path {
        Path::Root => String::new(),
        Path::Seq { parent, index } => format!("{}[{index}]", dotted(parent)),
        Path::Map { parent, key } => match dotted(parent) {
            parent if parent.is_empty() => key.clone(),
            parent => format!("{parent}.{key}"),
        },
        Path::Some { parent } | Path::NewtypeStruct { parent } | Path::NewtypeVariant { parent } => {
            dotted(parent)
        }
    }
}

/// Apply a single patch to a document tree
pub fn apply_to_value(document: &mut Value, patch: &Patch) -> std::result::Result<(), String> {
    match patch {
        Patch::StrategicMerge(fragment) => {
            strategic_merge(document, fragment);
            Ok(())
        }
        Patch::Json6902(ops) => json_patch::patch(document, &ops.0).map_err(|e| e.to_string()),
    }
}

/// Merge `patch` onto `target`
pub fn strategic_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                if is_delete_directive(value) {
                    target.remove(key);
                    continue;
                }
                match target.get_mut(key) {
                    Some(existing) => strategic_merge(existing, value),
                    None => {
                        target.insert(key.clone(), strip_directives(value));
                    }
                }
            }
        }
        (Value::Array(target), Value::Array(patch)) => {
            target.extend(patch.iter().map(strip_directives));
        }
        (target, patch) => *target = strip_directives(patch),
    }
}

fn is_delete_directive(value: &Value) -> bool {
    value
        .as_object()
        .and_then(|map| map.get(DELETE_DIRECTIVE_KEY))
        .and_then(Value::as_str)
        == Some(DELETE_DIRECTIVE_VALUE)
}

fn strip_directives(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, value)| *key != DELETE_DIRECTIVE_KEY && !is_delete_directive(value))
                .map(|(key, value)| (key.clone(), strip_directives(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_directives).collect()),
        other => other.clone(),
    }
}
