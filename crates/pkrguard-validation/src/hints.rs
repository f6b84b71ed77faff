//! Static performance hints
//!
//! Cheap rules over the parsed template. Each hint costs the performance
//! dimension a fixed amount.

use pkrguard_config::{Component, Configuration};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;

/// Inline commands in one provisioner before a hint fires
pub const MAX_INLINE_COMMANDS: usize = 10;

/// Shell provisioners before a hint fires
pub const MAX_SHELL_PROVISIONERS: usize = 3;

static FULL_UPGRADE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(apt(-get)?\s+(-y\s+)?(dist-|full-)?upgrade|yum\s+(-y\s+)?update|dnf\s+(-y\s+)?upgrade)\b")
        .expect("hardcoded regex")
});

static UNDERSIZED_INSTANCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^t[23]a?\.(nano|micro)$").expect("hardcoded regex"));

/// One performance observation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceHint {
    /// Stable rule identifier
    pub id: String,
    /// Component the hint is about
    pub component: String,
    pub message: String,
    pub recommendation: String,
}

impl PerformanceHint {
    fn new(id: &str, component: &Component, message: String, recommendation: &str) -> Self {
        Self {
            id: id.to_string(),
            component: component.display_name().to_string(),
            message,
            recommendation: recommendation.to_string(),
        }
    }
}

fn inline_commands(component: &Component) -> Vec<&str> {
    match component.get("inline") {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
        Some(Value::String(s)) => vec![s.as_str()],
        _ => Vec::new(),
    }
}

fn is_true(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Every hint for a configuration, builders first
#[must_use]
pub fn performance_hints(config: &Configuration) -> Vec<PerformanceHint> {
    let mut hints = Vec::new();

    for builder in config.builders() {
        if let Some(instance) = builder.get("instance_type").and_then(Value::as_str) {
            if UNDERSIZED_INSTANCE.is_match(instance) {
                hints.push(PerformanceHint::new(
                    "undersized-instance",
                    builder,
                    format!("build instance {instance} is burstable and small"),
                    "Build on a larger instance type; the image size does not depend on it",
                ));
            }
        }
        if builder.kind.ends_with("-iso") && !is_true(builder.get("headless")) {
            hints.push(PerformanceHint::new(
                "iso-not-headless",
                builder,
                format!("{} builder opens a console window", builder.kind),
                "Set headless to true",
            ));
        }
        if (builder.kind.starts_with("virtualbox") || builder.kind.starts_with("qemu"))
            && (builder.get("cpus").is_none() || builder.get("memory").is_none())
        {
            hints.push(PerformanceHint::new(
                "default-vm-resources",
                builder,
                format!("{} builder runs with default cpus/memory", builder.kind),
                "Set cpus and memory explicitly",
            ));
        }
    }

    let mut shell_count = 0;
    for provisioner in config.provisioners() {
        if provisioner.kind == "shell" {
            shell_count += 1;
        }
        let commands = inline_commands(provisioner);
        if commands.len() > MAX_INLINE_COMMANDS {
            hints.push(PerformanceHint::new(
                "long-inline-script",
                provisioner,
                format!("{} inline commands in one provisioner", commands.len()),
                "Move the commands into a script file",
            ));
        }
        if commands.iter().any(|c| FULL_UPGRADE.is_match(c)) {
            hints.push(PerformanceHint::new(
                "full-upgrade",
                provisioner,
                "provisioner upgrades every installed package".to_string(),
                "Start from a newer base image or install only what the image needs",
            ));
        }
        if provisioner.get("pause_before").is_some() {
            hints.push(PerformanceHint::new(
                "pause-before",
                provisioner,
                "provisioner sleeps before running".to_string(),
                "Wait on a readiness condition instead of a fixed pause",
            ));
        }
    }

    if shell_count >= MAX_SHELL_PROVISIONERS {
        if let Some(last) = config.provisioners().iter().rev().find(|p| p.kind == "shell") {
            hints.push(PerformanceHint::new(
                "many-shell-provisioners",
                last,
                format!("{shell_count} separate shell provisioners"),
                "Merge shell provisioners to save communicator round trips",
            ));
        }
    }

    hints
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkrguard_test_utils::{config, CLEAN_DOCKER, HARDCODED_PASSWORD};

    fn ids(text: &str) -> Vec<String> {
        performance_hints(&config("t.json", text))
            .into_iter()
            .map(|h| h.id)
            .collect()
    }

    #[test]
    fn clean_docker_has_no_hints() {
        assert!(ids(CLEAN_DOCKER).is_empty());
    }

    #[test]
    fn micro_instance_is_flagged() {
        let hints = performance_hints(&config("t.json", HARDCODED_PASSWORD));
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].id, "undersized-instance");
        assert_eq!(hints[0].component, "web");
    }

    #[test]
    fn iso_builder_rules() {
        let text = r#"{
          "builders": [{"type": "virtualbox-iso", "iso_checksum": "sha256:ab", "cpus": 2}],
          "provisioners": [{"type": "shell", "pause_before": "30s",
                            "inline": ["sudo apt-get -y dist-upgrade"]}]
        }"#;
        assert_eq!(
            ids(text),
            vec!["iso-not-headless", "default-vm-resources", "full-upgrade", "pause-before"]
        );
    }

    #[test]
    fn provisioner_volume_rules() {
        let commands: Vec<String> = (0..12).map(|i| format!("\"echo {i}\"")).collect();
        let text = format!(
            r#"{{
              "builders": [{{"type": "docker", "image": "ubuntu"}}],
              "provisioners": [
                {{"type": "shell", "inline": [{}]}},
                {{"type": "shell", "inline": ["true"]}},
                {{"type": "shell", "inline": ["true"]}}
              ]
            }}"#,
            commands.join(", ")
        );
        assert_eq!(ids(&text), vec!["long-inline-script", "many-shell-provisioners"]);
    }
}
