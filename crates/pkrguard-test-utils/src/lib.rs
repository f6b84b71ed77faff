//! Testing utilities for the pkrguard workspace
//!
//! Shared fixtures and helpers.

#![allow(missing_docs)]

use pkrguard_config::{parse_str, ConfigFormat, Configuration};
use pkrguard_patterns::PatternStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Docker build with nothing to report
pub const CLEAN_DOCKER: &str = r#"{
  "variables": {
    "base_image": "ubuntu:22.04"
  },
  "builders": [
    {
      "type": "docker",
      "name": "app",
      "image": "{{user `base_image`}}",
      "commit": true
    }
  ],
  "provisioners": [
    {
      "type": "shell",
      "inline": ["apt-get update", "apt-get install -y nginx"]
    }
  ]
}
"#;

/// AWS build whose only defect is a literal SSH password
pub const HARDCODED_PASSWORD: &str = r#"{
  "variables": {
    "region": "us-east-1"
  },
  "builders": [
    {
      "type": "amazon-ebs",
      "name": "web",
      "region": "{{user `region`}}",
      "instance_type": "t3.micro",
      "source_ami_filter": {
        "filters": {"name": "ubuntu/images/*ubuntu-jammy-22.04-amd64-server-*"},
        "owners": ["099720109477"],
        "most_recent": true
      },
      "ssh_username": "ubuntu",
      "ssh_password": "hunter2",
      "ssh_timeout": "10m",
      "ami_name": "web-{{timestamp}}"
    }
  ],
  "provisioners": [
    {
      "type": "shell",
      "inline": ["sudo apt-get update"]
    }
  ]
}
"#;

/// AWS build with an SSH timeout too short for the instance to boot
pub const SHORT_SSH_TIMEOUT: &str = r#"{
  "variables": {
    "region": "us-east-1"
  },
  "builders": [
    {
      "type": "amazon-ebs",
      "name": "web",
      "region": "{{user `region`}}",
      "instance_type": "t3.micro",
      "source_ami_filter": {
        "filters": {"name": "ubuntu/images/*ubuntu-jammy-22.04-amd64-server-*"},
        "owners": ["099720109477"],
        "most_recent": true
      },
      "ssh_username": "ubuntu",
      "ssh_timeout": "2m",
      "ami_name": "web-{{timestamp}}"
    }
  ],
  "provisioners": [
    {
      "type": "shell",
      "inline": ["sudo apt-get update"]
    }
  ]
}
"#;

/// JSON that does not parse
pub const TRAILING_COMMA: &str = "{\n  \"builders\": [\n    {\"type\": \"docker\", \"image\": \"ubuntu\",}\n  ]\n}\n";

/// Build output for an SSH timeout on the `web` builder
pub const SSH_TIMEOUT_LOG: &str = "\
==> web: Prevalidating AMI Name: web-1700000000
==> web: Launching a source AWS instance...
==> web: Waiting for instance to become ready...
==> web: Waiting for SSH to become available...
==> web: Timeout waiting for SSH.
==> web: Terminating the source AWS instance...
Build 'web' errored after 2 minutes 14 seconds: Timeout waiting for SSH.

==> Wait completed after 2 minutes 14 seconds

==> Some builds didn't complete successfully and had errors:
--> web: Timeout waiting for SSH.
";

/// Parse a JSON fixture
pub fn config(name: &str, text: &str) -> Configuration {
    parse_str(name, text, ConfigFormat::Json).unwrap()
}

/// Write a fixture under `dir` and return its path
pub fn write_fixture(dir: &Path, name: &str, text: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, text).unwrap();
    path
}

/// Store seeded with the built-in catalog
pub fn builtin_store() -> Arc<PatternStore> {
    Arc::new(PatternStore::builtin().unwrap())
}

/// Temporary directory for a test
pub fn scratch() -> tempfile::TempDir {
    tempfile::tempdir().unwrap()
}
