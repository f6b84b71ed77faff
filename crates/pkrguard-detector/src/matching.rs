//! The two detection passes

use pkrguard_config::{
    locate_field, unresolved_references, Configuration, FieldEntry, Location, Section,
};
use pkrguard_patterns::{DelusionPattern, Matcher, Pass, PatternSnapshot};
use std::collections::HashMap;

/// Structural pass over the normalized field list
#[must_use]
pub fn structural_matches(
    snapshot: &PatternSnapshot,
    config: &Configuration,
    fields: &[FieldEntry],
) -> Vec<DelusionPattern> {
    let file = config.source();
    let raw = config.raw();
    let mut out = Vec::new();

    for compiled in snapshot.for_pass(Pass::Structural) {
        let pattern = &compiled.pattern;
        match &compiled.matcher {
            Matcher::Field { path, value } => {
                let mut seen: HashMap<(&str, String), usize> = HashMap::new();
                for field in fields {
                    let text = field.text();
                    if !path.is_match(&field.path) || !value.is_match(&text) {
                        continue;
                    }
                    let nth = seen.entry((field.key.as_str(), text.to_string())).or_insert(0);
                    let location = locate_field(file, raw, &field.key, Some(text.as_ref()), *nth);
                    *nth += 1;
                    out.push(pattern.at(location));
                }
            }
            Matcher::Missing { section, kind, key } => {
                let mut seen: HashMap<&str, usize> = HashMap::new();
                for component in config.section(*section) {
                    let nth = seen.entry(component.kind.as_str()).or_insert(0);
                    let this = *nth;
                    *nth += 1;
                    if kind.is_match(&component.kind) && component.get(key).is_none() {
                        let location = locate_field(file, raw, "type", Some(component.kind.as_str()), this);
                        out.push(pattern.at(location));
                    }
                }
            }
            Matcher::Empty(section) => {
                if config.section(*section).is_empty() {
                    out.push(pattern.at(Location::whole_file(file)));
                }
            }
            Matcher::Duplicate { section, key } => {
                let mut seen: HashMap<String, usize> = HashMap::new();
                for component in config.section(*section) {
                    let Some(value) = component_value(component, key) else {
                        continue;
                    };
                    let count = seen.entry(value.clone()).or_insert(0);
                    if *count > 0 {
                        let location = locate_field(file, raw, key, Some(value.as_str()), *count);
                        out.push(pattern.at(location));
                    }
                    *count += 1;
                }
            }
            Matcher::UnresolvedVariable => {
                for (name, path) in unresolved_references(config, fields) {
                    let key = fields
                        .iter()
                        .find(|f| f.path == path)
                        .map_or("", |f| f.key.as_str());
                    let location = locate_field(file, raw, key, Some(name.as_str()), 0);
                    out.push(pattern.at(location));
                }
            }
            Matcher::Text(_) => {}
        }
    }
    out
}

fn component_value(component: &pkrguard_config::Component, key: &str) -> Option<String> {
    if key == "name" {
        return component.name.clone();
    }
    if key == "type" {
        return Some(component.kind.clone());
    }
    component.get(key).map(|v| match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

/// Textual pass over raw source
///
/// Works on any text, including input that failed to parse.
#[must_use]
pub fn textual_matches(snapshot: &PatternSnapshot, file: &str, raw: &str) -> Vec<DelusionPattern> {
    let mut out = Vec::new();
    for compiled in snapshot.for_pass(Pass::Textual) {
        if let Matcher::Text(regex) = &compiled.matcher {
            for m in regex.find_iter(raw) {
                let location = Location::from_offset(file, raw, m.start(), m.len());
                out.push(compiled.pattern.at(location));
            }
        }
    }
    out
}

/// Sections a configuration declares, for logging
#[must_use]
pub fn section_sizes(config: &Configuration) -> [(Section, usize); 3] {
    Section::ALL.map(|s| (s, config.section(s).len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkrguard_config::{parse_str, normalize, ConfigFormat};
    use pkrguard_patterns::{builtin, PatternKind, Severity};

    fn snapshot(exprs: &[&str]) -> PatternSnapshot {
        let patterns = exprs
            .iter()
            .map(|e| DelusionPattern::new(PatternKind::Build, Severity::Medium, *e, "d", "r", 0.5))
            .collect();
        PatternSnapshot::compile(1, patterns).unwrap()
    }

    fn run(exprs: &[&str], json: &str) -> Vec<DelusionPattern> {
        let config = parse_str("t.json", json, ConfigFormat::Json).unwrap();
        let fields = normalize(&config).unwrap();
        let snap = snapshot(exprs);
        let mut out = structural_matches(&snap, &config, &fields);
        out.extend(textual_matches(&snap, config.source(), config.raw()));
        out
    }

    #[test]
    fn field_matches_get_distinct_locations() {
        let json = "{\"builders\": [\n{\"type\": \"docker\", \"ssh_username\": \"root\"},\n{\"type\": \"docker\", \"ssh_username\": \"root\"}\n]}";
        let out = run(&[r"field:.*\.ssh_username=^root$"], json);
        assert_eq!(out.len(), 2);
        assert_ne!(out[0].location, out[1].location);
    }

    #[test]
    fn missing_key_matches_only_matching_types() {
        let json = r#"{"builders": [{"type": "amazon-ebs"}, {"type": "docker"}, {"type": "amazon-ebs", "ami_name": "x"}]}"#;
        let out = run(&["missing:builders[amazon-ebs].ami_name"], json);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn empty_section_is_whole_file() {
        let out = run(&["empty:provisioners"], r#"{"builders": [{"type": "docker"}]}"#);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].location.as_ref().unwrap().line, 0);
    }

    #[test]
    fn duplicate_names_flag_the_repeat() {
        let json = "{\"builders\": [\n{\"type\": \"docker\", \"name\": \"a\"},\n{\"type\": \"docker\", \"name\": \"a\"}\n]}";
        let out = run(&["duplicate:builders.name"], json);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].location.as_ref().unwrap().line, 3);
    }

    #[test]
    fn unresolved_variables_are_reported() {
        let json = r#"{"variables": {"a": "1"}, "builders": [{"type": "docker", "image": "{{user `a`}}:{{user `b`}}"}]}"#;
        let out = run(&["unresolved-variable"], json);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn text_pass_works_on_broken_input() {
        let snap = PatternSnapshot::compile(1, builtin::catalog()).unwrap();
        let raw = "{\n  \"builders\": [\n    {\"type\": \"docker\",}\n  ]\n}";
        let out = textual_matches(&snap, "broken.json", raw);
        assert!(out.iter().any(|p| p.pattern == builtin::TRAILING_COMMA));
        let loc = out[0].location.as_ref().unwrap();
        assert_eq!(loc.line, 3);
    }
}
