//! Packer configuration model
//!
//! A [`Configuration`] is immutable once loaded. It keeps the raw source text
//! next to the structured document so the textual detection pass and the
//! structural pass always look at the same input.

use crate::hash::ConfigHash;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// The component sections of a template
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Builders,
    Provisioners,
    PostProcessors,
}

impl Section {
    /// All sections in document order
    pub const ALL: [Section; 3] = [Section::Builders, Section::Provisioners, Section::PostProcessors];

    /// Name used in normalized paths and matcher expressions
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Section::Builders => "builders",
            Section::Provisioners => "provisioners",
            Section::PostProcessors => "post_processors",
        }
    }

    /// Parse a section name (`post-processors` accepted)
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "builders" => Some(Section::Builders),
            "provisioners" => Some(Section::Provisioners),
            "post_processors" | "post-processors" => Some(Section::PostProcessors),
            _ => None,
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A builder, provisioner or post-processor block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    /// The `type` tag (`amazon-ebs`, `shell`, `manifest`, ...)
    pub kind: String,
    /// Optional `name` attribute
    pub name: Option<String>,
    /// Every other attribute, opaque
    pub settings: Map<String, Value>,
}

impl Component {
    /// Create a component with no settings
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: None,
            settings: Map::new(),
        }
    }

    /// Builder-style setting
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    /// Builder-style name
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Name if set, otherwise the type tag
    #[inline]
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.kind)
    }

    /// Look up a setting
    #[inline]
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }

    /// Re-assemble the JSON object this component was parsed from
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut obj = self.settings.clone();
        obj.insert("type".to_string(), Value::String(self.kind.clone()));
        if let Some(name) = &self.name {
            obj.insert("name".to_string(), Value::String(name.clone()));
        }
        Value::Object(obj)
    }
}

/// A user-declared validation rule carried with the template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRule {
    /// Normalized field path the rule applies to
    pub field: String,
    /// Regex the field value must match
    pub must_match: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// On-disk format of a configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigFormat {
    Json,
    Yaml,
    Hcl,
}

impl ConfigFormat {
    /// Guess the format from a file name
    #[must_use]
    pub fn from_path(path: &std::path::Path) -> Self {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if name.ends_with(".hcl") {
            ConfigFormat::Hcl
        } else if name.ends_with(".yaml") || name.ends_with(".yml") {
            ConfigFormat::Yaml
        } else {
            ConfigFormat::Json
        }
    }
}

/// A parsed Packer configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Configuration {
    source: String,
    format: ConfigFormat,
    variables: BTreeMap<String, Value>,
    builders: Vec<Component>,
    provisioners: Vec<Component>,
    post_processors: Vec<Component>,
    validation_rules: Vec<ValidationRule>,
    /// Raw source text the document was parsed from
    #[serde(skip)]
    raw: Arc<str>,
    #[serde(skip)]
    hash: ConfigHash,
}

impl Configuration {
    /// Assemble a configuration from parts
    ///
    /// The raw text is rendered from the structured document when none is
    /// supplied, so textual patterns still have something to scan.
    #[must_use]
    pub fn from_parts(
        source: impl Into<String>,
        format: ConfigFormat,
        variables: BTreeMap<String, Value>,
        sections: [Vec<Component>; 3],
        validation_rules: Vec<ValidationRule>,
        raw: Option<Arc<str>>,
    ) -> Self {
        let [builders, provisioners, post_processors] = sections;
        let mut config = Self {
            source: source.into(),
            format,
            variables,
            builders,
            provisioners,
            post_processors,
            validation_rules,
            raw: Arc::from(""),
            hash: ConfigHash::default(),
        };
        let document = config.to_document();
        config.hash = ConfigHash::of_canonical(&document);
        config.raw = raw.unwrap_or_else(|| {
            Arc::from(serde_json::to_string_pretty(&document).unwrap_or_default())
        });
        config
    }

    /// Source identity (path or label)
    #[inline]
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[inline]
    #[must_use]
    pub fn format(&self) -> ConfigFormat {
        self.format
    }

    /// Declared variables and their defaults
    #[inline]
    #[must_use]
    pub fn variables(&self) -> &BTreeMap<String, Value> {
        &self.variables
    }

    #[inline]
    #[must_use]
    pub fn builders(&self) -> &[Component] {
        &self.builders
    }

    #[inline]
    #[must_use]
    pub fn provisioners(&self) -> &[Component] {
        &self.provisioners
    }

    #[inline]
    #[must_use]
    pub fn post_processors(&self) -> &[Component] {
        &self.post_processors
    }

    #[inline]
    #[must_use]
    pub fn validation_rules(&self) -> &[ValidationRule] {
        &self.validation_rules
    }

    /// Components of one section
    #[inline]
    #[must_use]
    pub fn section(&self, section: Section) -> &[Component] {
        match section {
            Section::Builders => &self.builders,
            Section::Provisioners => &self.provisioners,
            Section::PostProcessors => &self.post_processors,
        }
    }

    /// Configuration identity
    #[inline]
    #[must_use]
    pub fn hash(&self) -> ConfigHash {
        self.hash
    }

    /// Raw source text
    #[inline]
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Shared handle to the raw source text
    #[inline]
    #[must_use]
    pub fn raw_shared(&self) -> Arc<str> {
        Arc::clone(&self.raw)
    }

    /// Whether a variable is declared
    #[inline]
    #[must_use]
    pub fn declares(&self, variable: &str) -> bool {
        self.variables.contains_key(variable)
    }

    /// Structured document in Packer's JSON template shape
    #[must_use]
    pub fn to_document(&self) -> Value {
        let mut root = Map::new();
        if !self.variables.is_empty() {
            root.insert(
                "variables".to_string(),
                Value::Object(self.variables.clone().into_iter().collect()),
            );
        }
        for section in Section::ALL {
            let items = self.section(section);
            if !items.is_empty() {
                let key = match section {
                    Section::PostProcessors => "post-processors",
                    other => other.as_str(),
                };
                root.insert(
                    key.to_string(),
                    Value::Array(items.iter().map(Component::to_value).collect()),
                );
            }
        }
        if !self.validation_rules.is_empty() {
            root.insert(
                "validation_rules".to_string(),
                serde_json::to_value(&self.validation_rules).unwrap_or(Value::Null),
            );
        }
        Value::Object(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Configuration {
        let builder = Component::new("amazon-ebs")
            .named("ubuntu")
            .with("region", json!("us-east-1"));
        Configuration::from_parts(
            "sample.json",
            ConfigFormat::Json,
            BTreeMap::from([("region".to_string(), json!("us-east-1"))]),
            [vec![builder], vec![Component::new("shell")], vec![]],
            vec![],
            None,
        )
    }

    #[test]
    fn section_accessors() {
        let config = sample();
        assert_eq!(config.section(Section::Builders).len(), 1);
        assert_eq!(config.section(Section::Provisioners)[0].kind, "shell");
        assert!(config.section(Section::PostProcessors).is_empty());
        assert_eq!(config.builders()[0].display_name(), "ubuntu");
    }

    #[test]
    fn raw_text_rendered_when_absent() {
        let config = sample();
        assert!(config.raw().contains("amazon-ebs"));
    }

    #[test]
    fn hash_is_stable() {
        assert_eq!(sample().hash(), sample().hash());
        assert!(!sample().hash().is_zero());
    }

    #[test]
    fn section_names() {
        assert_eq!(Section::parse("post-processors"), Some(Section::PostProcessors));
        assert_eq!(Section::parse("nope"), None);
        assert_eq!(Section::Builders.to_string(), "builders");
    }

    #[test]
    fn format_from_path() {
        use std::path::Path;
        assert_eq!(ConfigFormat::from_path(Path::new("a.pkr.hcl")), ConfigFormat::Hcl);
        assert_eq!(ConfigFormat::from_path(Path::new("a.yml")), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("a.json")), ConfigFormat::Json);
    }
}
