//! Flattening a configuration into addressable fields
//!
//! The structural detection pass never walks the JSON tree directly. It sees an
//! ordered list of [`FieldEntry`] values whose paths look like
//! `builders[0].ssh_username` or `provisioners[1].inline[0]`.

use crate::model::{Configuration, Section};
use crate::parse::ParseError;
use regex::Regex;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Deepest nesting accepted below the document root
pub const MAX_DEPTH: usize = 32;

static USER_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*user\s+`([^`]*)`\s*\}\}").expect("hardcoded regex")
});

static VAR_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bvar\.([A-Za-z_][A-Za-z0-9_-]*)").expect("hardcoded regex")
});

/// One scalar leaf of the configuration
#[derive(Debug, Clone, PartialEq)]
pub struct FieldEntry {
    /// Full path (`builders[0].ssh_username`)
    pub path: String,
    /// Owning section, `None` for `variables.*`
    pub section: Option<Section>,
    /// Index of the owning component within its section
    pub component: Option<usize>,
    /// Last object key on the path
    pub key: String,
    /// Scalar value
    pub value: Value,
}

impl FieldEntry {
    /// Value as text (strings unquoted, other scalars in JSON form)
    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        match &self.value {
            Value::String(s) => Cow::Borrowed(s.as_str()),
            other => Cow::Owned(other.to_string()),
        }
    }
}

/// Flatten a configuration into its scalar fields, in document order
///
/// # Errors
/// [`ParseError::Normalize`] when a component has no `type`, a variable name
/// is empty, or nesting is deeper than [`MAX_DEPTH`].
pub fn normalize(config: &Configuration) -> Result<Vec<FieldEntry>, ParseError> {
    let fail = |message: String| ParseError::Normalize {
        origin: config.source().to_string(),
        message,
    };

    let mut out = Vec::new();

    for (name, value) in config.variables() {
        if name.trim().is_empty() {
            return Err(fail("variable with empty name".to_string()));
        }
        let mut walker = Walker {
            out: &mut out,
            section: None,
            component: None,
        };
        walker
            .walk(&format!("variables.{name}"), name, value, 1)
            .map_err(fail)?;
    }

    for section in Section::ALL {
        for (idx, component) in config.section(section).iter().enumerate() {
            let base = format!("{section}[{idx}]");
            if component.kind.trim().is_empty() {
                return Err(fail(format!("{base} has no `type`")));
            }
            let mut walker = Walker {
                out: &mut out,
                section: Some(section),
                component: Some(idx),
            };
            walker
                .walk(&format!("{base}.type"), "type", &Value::String(component.kind.clone()), 2)
                .map_err(fail)?;
            if let Some(name) = &component.name {
                walker
                    .walk(&format!("{base}.name"), "name", &Value::String(name.clone()), 2)
                    .map_err(fail)?;
            }
            for (key, value) in &component.settings {
                walker
                    .walk(&format!("{base}.{key}"), key, value, 2)
                    .map_err(fail)?;
            }
        }
    }

    Ok(out)
}

struct Walker<'a> {
    out: &'a mut Vec<FieldEntry>,
    section: Option<Section>,
    component: Option<usize>,
}

impl Walker<'_> {
    fn walk(&mut self, path: &str, key: &str, value: &Value, depth: usize) -> Result<(), String> {
        if depth > MAX_DEPTH {
            return Err(format!("{path} nests deeper than {MAX_DEPTH} levels"));
        }
        match value {
            Value::Object(map) => {
                for (child, v) in map {
                    self.walk(&format!("{path}.{child}"), child, v, depth + 1)?;
                }
            }
            Value::Array(items) => {
                for (i, v) in items.iter().enumerate() {
                    self.walk(&format!("{path}[{i}]"), key, v, depth + 1)?;
                }
            }
            scalar => self.out.push(FieldEntry {
                path: path.to_string(),
                section: self.section,
                component: self.component,
                key: key.to_string(),
                value: scalar.clone(),
            }),
        }
        Ok(())
    }
}

/// Variable names referenced through `{{user `x`}}` or `var.x`
#[must_use]
pub fn variable_references(text: &str) -> BTreeSet<String> {
    USER_REF
        .captures_iter(text)
        .chain(VAR_REF.captures_iter(text))
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// References in `config` that name undeclared variables, with the field
/// they were found in
#[must_use]
pub fn unresolved_references(config: &Configuration, fields: &[FieldEntry]) -> Vec<(String, String)> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for field in fields.iter().filter(|f| f.section.is_some()) {
        if let Value::String(text) = &field.value {
            for name in variable_references(text) {
                if !config.declares(&name) && seen.insert(name.clone()) {
                    out.push((name, field.path.clone()));
                }
            }
        }
    }
    out
}
