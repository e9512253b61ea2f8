//! Annotated YAML encoder
//!
//! Emits 4-space indented YAML in field declaration order. Two independent
//! annotations can be switched on:
//!
//! - `docs`: every documented key is preceded by `# <description>` lines;
//! - `examples`: documented keys carrying an example get a commented example
//!   block, and documented keys missing from the document are emitted as
//!   commented example blocks at the end of their parent map.
//!
//! Output depends only on the document and the options.

use serde::Serialize;
use serde_json::{Map, Value};

use super::docs;
use crate::{Error, Result};

const INDENT: &str = "    ";

/// Which annotations to emit
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EncoderOptions {
    /// Emit field descriptions
    pub docs: bool,
    /// Emit commented examples
    pub examples: bool,
}

impl EncoderOptions {
    /// No annotations
    pub fn plain() -> Self {
        Self::default()
    }
}

/// Encode `document` as annotated YAML
pub fn encode<T: Serialize>(document: &T, options: EncoderOptions) -> Result<String> {
    let value = serde_json::to_value(document)?;
    let Value::Object(map) = value else {
        return Err(Error::serialization("document root must be a map"));
    };

    let lines = Emitter { options }.map_lines(&map, Some(""))?;
    let mut out = lines.join("\n");
    out.push('\n');
    Ok(out)
}

struct Emitter {
    options: EncoderOptions,
}

impl Emitter {
    fn plain() -> Self {
        Self {
            options: EncoderOptions::plain(),
        }
    }

    /// Lines for a map; `path` is `None` inside lists where no docs apply
    fn map_lines(&self, map: &Map<String, Value>, path: Option<&str>) -> Result<Vec<String>> {
        let mut lines = Vec::new();

        for (key, value) in map {
            let child = path.map(|p| join_path(p, key));
            if let Some(doc) = child.as_deref().and_then(docs::lookup) {
                if self.options.docs {
                    lines.extend(description_lines(doc.description));
                }
                if self.options.examples {
                    if let Some(example) = &doc.example {
                        lines.extend(example_lines(key, example)?);
                    }
                }
            }
            lines.extend(self.entry_lines(key, value, child.as_deref())?);
        }

        if self.options.examples {
            if let Some(path) = path {
                for (key, doc) in docs::documented_children(path) {
                    if map.contains_key(key) {
                        continue;
                    }
                    let Some(example) = &doc.example else {
                        continue;
                    };
                    if self.options.docs {
                        lines.extend(description_lines(doc.description));
                    }
                    lines.extend(example_lines(key, example)?);
                }
            }
        }

        Ok(lines)
    }

    fn entry_lines(&self, key: &str, value: &Value, path: Option<&str>) -> Result<Vec<String>> {
        let key = scalar_text(&Value::String(key.to_string()))?;

        let lines = match value {
            Value::Object(map) if !map.is_empty() => {
                let mut lines = vec![format!("{key}:")];
                lines.extend(indent(self.map_lines(map, path)?));
                lines
            }
            Value::Array(items) if !items.is_empty() => {
                let mut lines = vec![format!("{key}:")];
                lines.extend(indent(self.seq_lines(items)?));
                lines
            }
            Value::String(text) if use_block_scalar(text) => {
                let mut lines = vec![format!("{key}: {}", block_header(text))];
                lines.extend(indent(block_body(text)));
                lines
            }
            scalar => vec![format!("{key}: {}", scalar_text(scalar)?)],
        };

        Ok(lines)
    }

    fn seq_lines(&self, items: &[Value]) -> Result<Vec<String>> {
        let mut lines = Vec::new();

        for item in items {
            let inner = match item {
                Value::Object(map) if !map.is_empty() => self.map_lines(map, None)?,
                Value::Array(nested) if !nested.is_empty() => self.seq_lines(nested)?,
                Value::String(text) if use_block_scalar(text) => {
                    let mut inner = vec![block_header(text).to_string()];
                    inner.extend(indent(block_body(text)));
                    inner
                }
                scalar => vec![scalar_text(scalar)?],
            };

            for (i, line) in inner.into_iter().enumerate() {
                if i == 0 {
                    lines.push(format!("- {line}"));
                } else if line.is_empty() {
                    lines.push(line);
                } else {
                    lines.push(format!("  {line}"));
                }
            }
        }

        Ok(lines)
    }
}

fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

fn indent(lines: Vec<String>) -> impl Iterator<Item = String> {
    lines.into_iter().map(|line| {
        if line.is_empty() {
            line
        } else {
            format!("{INDENT}{line}")
        }
    })
}

fn description_lines(description: &str) -> impl Iterator<Item = String> + '_ {
    description.lines().map(|line| format!("# {line}"))
}

fn example_lines(key: &str, example: &Value) -> Result<Vec<String>> {
    let lines = Emitter::plain().entry_lines(key, example, None)?;
    Ok(lines
        .into_iter()
        .map(|line| {
            if line.is_empty() {
                "#".to_string()
            } else {
                format!("# {line}")
            }
        })
        .collect())
}

/// Single-line rendering of a scalar (or empty collection), quoted as needed
fn scalar_text(value: &Value) -> Result<String> {
    let rendered = serde_yaml::to_string(value)?;
    let rendered = rendered.trim_end_matches('\n');
    if rendered.contains('\n') {
        // JSON string escapes are valid in double-quoted YAML.
        return Ok(serde_json::to_string(value)?);
    }
    Ok(rendered.to_string())
}

fn use_block_scalar(text: &str) -> bool {
    text.contains('\n')
        && !text.starts_with([' ', '\n'])
        && !text.contains('\r')
        && !text.ends_with("\n\n")
}

fn block_header(text: &str) -> &'static str {
    if text.ends_with('\n') {
        "|"
    } else {
        "|-"
    }
}

fn block_body(text: &str) -> Vec<String> {
    text.strip_suffix('\n')
        .unwrap_or(text)
        .split('\n')
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode_value(value: Value, options: EncoderOptions) -> String {
        encode(&value, options).unwrap()
    }

    #[test]
    fn nested_maps_use_four_spaces() {
        let out = encode_value(
            json!({ "machine": { "install": { "disk": "/dev/sda", "wipe": false } } }),
            EncoderOptions::plain(),
        );
        assert_eq!(
            out,
            "machine:\n    install:\n        disk: /dev/sda\n        wipe: false\n"
        );
    }

    #[test]
    fn lists_of_scalars_and_maps() {
        let out = encode_value(
            json!({ "items": ["a", 1], "routes": [{ "network": "0.0.0.0/0", "metric": 1024 }] }),
            EncoderOptions::plain(),
        );
        assert_eq!(
            out,
            "items:\n    - a\n    - 1\nroutes:\n    - network: 0.0.0.0/0\n      metric: 1024\n"
        );
    }

    #[test]
    fn empty_collections_and_ambiguous_strings() {
        let out = encode_value(
            json!({ "labels": {}, "sans": [], "flag": "true", "empty": "" }),
            EncoderOptions::plain(),
        );
        let parsed: Value = serde_yaml::from_str(&out).unwrap();
        assert_eq!(parsed["flag"], json!("true"));
        assert_eq!(parsed["empty"], json!(""));
        assert_eq!(parsed["labels"], json!({}));
        assert_eq!(parsed["sans"], json!([]));
    }

    #[test]
    fn multiline_strings_use_block_scalars() {
        let doc = json!({ "contents": "kind: Namespace\nmetadata:\n  name: ci" });
        let out = encode_value(doc.clone(), EncoderOptions::plain());
        assert!(out.starts_with("contents: |-\n    kind: Namespace\n"), "{out}");

        let parsed: Value = serde_yaml::from_str(&out).unwrap();
        assert_eq!(parsed, doc);
    }

    #[test]
    fn awkward_multiline_strings_stay_on_one_line() {
        for text in [
            "a: 1\n\n",
            " leading\nsecond",
            "\nstarts with a newline",
            "x\r\ny",
            "tab\there\n\n\n",
        ] {
            let doc = json!({
                "cluster": { "inlineManifests": [{ "name": "ci", "contents": text }] },
                "items": [text],
            });
            let out = encode_value(doc.clone(), EncoderOptions::plain());
            assert!(!out.contains('|'), "{text:?} rendered as a block:\n{out}");

            let parsed: Value = serde_yaml::from_str(&out).unwrap();
            assert_eq!(parsed, doc, "{text:?}");
        }
    }

    #[test]
    fn docs_precede_documented_keys() {
        let out = encode_value(
            json!({ "machine": { "install": { "disk": "/dev/sda" } } }),
            EncoderOptions {
                docs: true,
                examples: false,
            },
        );
        assert!(out.contains("        # The disk used for installations.\n        disk: /dev/sda\n"));
        assert!(!out.contains("# disk:"));
    }

    #[test]
    fn examples_cover_present_and_absent_fields() {
        let out = encode_value(
            json!({ "machine": { "install": { "disk": "/dev/sda" } } }),
            EncoderOptions {
                docs: false,
                examples: true,
            },
        );
        assert!(out.contains("        # disk: /dev/nvme0\n        disk: /dev/sda\n"), "{out}");
        assert!(out.contains("        # extraKernelArgs:\n        #     - talos.platform=metal\n"));
        assert!(!out.contains("# The disk used"));
    }

    #[test]
    fn annotations_do_not_change_the_document() {
        let doc = json!({ "machine": { "install": { "disk": "/dev/sda", "wipe": true } } });
        let plain: Value =
            serde_yaml::from_str(&encode_value(doc.clone(), EncoderOptions::plain())).unwrap();
        let annotated: Value = serde_yaml::from_str(&encode_value(
            doc.clone(),
            EncoderOptions {
                docs: true,
                examples: true,
            },
        ))
        .unwrap();
        assert_eq!(plain, doc);
        assert_eq!(annotated, doc);
    }

    #[test]
    fn output_is_deterministic() {
        let doc = json!({ "cluster": { "network": { "dnsDomain": "cluster.local" } } });
        let options = EncoderOptions {
            docs: true,
            examples: true,
        };
        assert_eq!(
            encode_value(doc.clone(), options),
            encode_value(doc, options)
        );
    }
}
