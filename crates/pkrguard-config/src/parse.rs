//! Configuration loading (JSON and YAML templates)
//!
//! HCL2 sources are accepted as raw text only: loading one returns
//! [`ParseError::Unstructured`] and callers fall back to the textual pass.

use crate::model::{Component, ConfigFormat, Configuration, Section, ValidationRule};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Errors turning text into a [`Configuration`]
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The text is not valid JSON/YAML
    #[error("syntax error in {origin} at {line}:{column}: {message}")]
    Syntax {
        origin: String,
        line: usize,
        column: usize,
        message: String,
    },

    /// Format has no structured parser (HCL)
    #[error("{origin} is {format:?}; only textual analysis is available")]
    Unstructured { origin: String, format: ConfigFormat },

    /// Valid syntax, wrong template shape
    #[error("invalid template shape in {origin}: {message}")]
    Shape { origin: String, message: String },

    /// Document cannot be normalized for analysis
    #[error("cannot normalize {origin}: {message}")]
    Normalize { origin: String, message: String },

    /// Reading the file failed
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ParseError {
    /// Whether the textual fallback pass can still run on the input
    #[inline]
    #[must_use]
    pub fn allows_textual_fallback(&self) -> bool {
        !matches!(self, ParseError::Io { .. })
    }

    fn shape(origin: &str, message: impl Into<String>) -> Self {
        Self::Shape {
            origin: origin.to_string(),
            message: message.into(),
        }
    }
}

/// Read and parse a configuration file, picking the format from its name
///
/// # Errors
/// I/O failures, syntax errors, unsupported formats and malformed templates.
pub fn load(path: impl AsRef<Path>) -> Result<Configuration, ParseError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_str(&path.display().to_string(), &text, ConfigFormat::from_path(path))
}

/// Parse configuration text
///
/// # Errors
/// See [`load`].
pub fn parse_str(origin: &str, text: &str, format: ConfigFormat) -> Result<Configuration, ParseError> {
    let document: Value = match format {
        ConfigFormat::Json => serde_json::from_str(text).map_err(|e| ParseError::Syntax {
            origin: origin.to_string(),
            line: e.line(),
            column: e.column(),
            message: e.to_string(),
        })?,
        ConfigFormat::Yaml => serde_yaml::from_str(text).map_err(|e| {
            let (line, column) = e.location().map_or((0, 0), |l| (l.line(), l.column()));
            ParseError::Syntax {
                origin: origin.to_string(),
                line,
                column,
                message: e.to_string(),
            }
        })?,
        ConfigFormat::Hcl => {
            return Err(ParseError::Unstructured {
                origin: origin.to_string(),
                format,
            })
        }
    };
    from_document(origin, format, &document, Some(Arc::from(text)))
}

/// Build a configuration from an already-decoded template document
///
/// Unknown top-level keys (`description`, `min_packer_version`, ...) are
/// ignored. Components without a `type` keep an empty kind; normalization
/// rejects them later.
///
/// # Errors
/// Returns [`ParseError::Shape`] when sections are not arrays of objects.
pub fn from_document(
    origin: &str,
    format: ConfigFormat,
    document: &Value,
    raw: Option<Arc<str>>,
) -> Result<Configuration, ParseError> {
    let root = document
        .as_object()
        .ok_or_else(|| ParseError::shape(origin, "top level must be an object"))?;

    let variables: BTreeMap<String, Value> = match root.get("variables") {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(Value::Object(vars)) => vars.clone().into_iter().collect(),
        Some(_) => return Err(ParseError::shape(origin, "`variables` must be an object")),
    };

    let mut sections: [Vec<Component>; 3] = Default::default();
    for (slot, section) in sections.iter_mut().zip(Section::ALL) {
        let value = match section {
            Section::PostProcessors => root
                .get("post-processors")
                .or_else(|| root.get("post_processors")),
            other => root.get(other.as_str()),
        };
        *slot = parse_section(origin, section, value)?;
    }

    let validation_rules: Vec<ValidationRule> = match root.get("validation_rules") {
        None | Some(Value::Null) => Vec::new(),
        Some(rules) => serde_json::from_value(rules.clone())
            .map_err(|e| ParseError::shape(origin, format!("`validation_rules`: {e}")))?,
    };

    Ok(Configuration::from_parts(
        origin,
        format,
        variables,
        sections,
        validation_rules,
        raw,
    ))
}

fn parse_section(
    origin: &str,
    section: Section,
    value: Option<&Value>,
) -> Result<Vec<Component>, ParseError> {
    let items = match value {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(_) => {
            return Err(ParseError::shape(
                origin,
                format!("`{section}` must be an array"),
            ))
        }
    };

    items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            let obj = item.as_object().ok_or_else(|| {
                ParseError::shape(origin, format!("{section}[{idx}] must be an object"))
            })?;
            Ok(component_from_object(obj))
        })
        .collect()
}

fn component_from_object(obj: &Map<String, Value>) -> Component {
    let mut settings = obj.clone();
    let kind = match settings.remove("type") {
        Some(Value::String(kind)) => kind,
        _ => String::new(),
    };
    let name = match settings.remove("name") {
        Some(Value::String(name)) => Some(name),
        Some(other) => {
            settings.insert("name".to_string(), other);
            None
        }
        None => None,
    };
    Component {
        kind,
        name,
        settings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = r#"{
  "variables": {"region": "us-east-1"},
  "builders": [{"type": "amazon-ebs", "name": "base", "region": "{{user `region`}}"}],
  "provisioners": [{"type": "shell", "inline": ["echo hi"]}],
  "post-processors": [{"type": "manifest"}]
}"#;

    #[test]
    fn parses_json_template() {
        let config = parse_str("t.json", TEMPLATE, ConfigFormat::Json).unwrap();
        assert_eq!(config.builders()[0].kind, "amazon-ebs");
        assert_eq!(config.builders()[0].name.as_deref(), Some("base"));
        assert_eq!(config.provisioners().len(), 1);
        assert_eq!(config.post_processors()[0].kind, "manifest");
        assert!(config.declares("region"));
        assert_eq!(config.raw(), TEMPLATE);
    }

    #[test]
    fn parses_yaml_template() {
        let yaml = "builders:\n  - type: docker\n    image: ubuntu\npost_processors:\n  - type: docker-tag\n";
        let config = parse_str("t.yaml", yaml, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.builders()[0].kind, "docker");
        assert_eq!(config.post_processors()[0].kind, "docker-tag");
    }

    #[test]
    fn syntax_error_carries_position() {
        let err = parse_str("bad.json", "{\n  \"builders\": [,]\n}", ConfigFormat::Json).unwrap_err();
        match err {
            ParseError::Syntax { line, .. } => assert_eq!(line, 2),
            other => panic!("expected syntax error, got {other:?}"),
        }
    }

    #[test]
    fn hcl_is_unstructured() {
        let err = parse_str("a.pkr.hcl", "source \"x\" \"y\" {}", ConfigFormat::Hcl).unwrap_err();
        assert!(matches!(err, ParseError::Unstructured { .. }));
        assert!(err.allows_textual_fallback());
    }

    #[test]
    fn wrong_shape_is_rejected() {
        let err = parse_str("t.json", r#"{"builders": {"type": "x"}}"#, ConfigFormat::Json).unwrap_err();
        assert!(matches!(err, ParseError::Shape { .. }));
    }

    #[test]
    fn key_order_does_not_change_hash() {
        let a = parse_str("a.json", r#"{"builders":[{"type":"docker","image":"u"}]}"#, ConfigFormat::Json).unwrap();
        let b = parse_str("b.json", r#"{"builders":[{"image":"u","type":"docker"}]}"#, ConfigFormat::Json).unwrap();
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("template.json");
        std::fs::write(&path, TEMPLATE).unwrap();
        let config = load(&path).unwrap();
        assert_eq!(config.format(), ConfigFormat::Json);

        let missing = load(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(missing, ParseError::Io { .. }));
        assert!(!missing.allows_textual_fallback());
    }
}
