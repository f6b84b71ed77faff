//! Step execution and file snapshots

use crate::error::{RecoveryError, StepError};
use crate::plan::{RecoveryAction, RecoveryStep};
use pkrguard_config::ConfigFormat;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;

static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(\s*[}\]])").expect("hardcoded regex"));

/// What a recovery operates on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryTarget {
    pub config_path: PathBuf,
    /// Root for directory actions
    pub work_dir: PathBuf,
}

impl RecoveryTarget {
    /// Target whose working directory is the configuration's directory
    #[must_use]
    pub fn for_config(config_path: impl Into<PathBuf>) -> Self {
        let config_path = config_path.into();
        let work_dir = config_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self {
            config_path,
            work_dir,
        }
    }
}

/// Runs recovery steps
#[async_trait::async_trait]
pub trait StepExecutor: Send + Sync {
    /// Files the step may modify; each is snapshotted before the step runs
    fn touched_paths(&self, step: &RecoveryStep, target: &RecoveryTarget) -> Vec<PathBuf> {
        if step.action.modifies_config() {
            vec![target.config_path.clone()]
        } else {
            Vec::new()
        }
    }

    /// Run one attempt of a step and describe what changed
    async fn execute(&self, step: &RecoveryStep, target: &RecoveryTarget) -> Result<String, StepError>;
}

/// Applies actions to files on disk
#[derive(Debug, Default, Clone, Copy)]
pub struct FileStepExecutor;

#[async_trait::async_trait]
impl StepExecutor for FileStepExecutor {
    async fn execute(&self, step: &RecoveryStep, target: &RecoveryTarget) -> Result<String, StepError> {
        match &step.action {
            RecoveryAction::RetryWithBackoff {
                attempts,
                base_delay_ms,
            } => Ok(format!(
                "build retry scheduled ({attempts} attempts, {base_delay_ms}ms base delay)"
            )),
            RecoveryAction::SetField { pointer, value } => {
                let path = &target.config_path;
                let mut doc = read_document(path).await?;
                set_pointer(&mut doc, pointer, value.clone())?;
                write_document(path, &doc).await?;
                Ok(format!("set {pointer} to {value}"))
            }
            RecoveryAction::AddProvisioner { inline } => {
                let path = &target.config_path;
                let mut doc = read_document(path).await?;
                let root = doc
                    .as_object_mut()
                    .ok_or_else(|| StepError::permanent("configuration root is not an object"))?;
                let provisioners = root
                    .entry("provisioners")
                    .or_insert_with(|| Value::Array(Vec::new()));
                let list = provisioners
                    .as_array_mut()
                    .ok_or_else(|| StepError::permanent("`provisioners` is not a list"))?;
                list.insert(0, serde_json::json!({"type": "shell", "inline": inline}));
                write_document(path, &doc).await?;
                Ok(format!("prepended shell provisioner ({} commands)", inline.len()))
            }
            RecoveryAction::RaiseCommunicatorTimeout { minimum } => {
                let floor = parse_duration(minimum)
                    .ok_or_else(|| StepError::permanent(format!("`{minimum}` is not a duration")))?;
                let path = &target.config_path;
                let mut doc = read_document(path).await?;
                let raised = raise_timeouts(&mut doc, minimum, floor);
                if raised.is_empty() {
                    return Ok("communicator timeouts already sufficient".to_string());
                }
                write_document(path, &doc).await?;
                Ok(format!("raised {} to {minimum}", raised.join(", ")))
            }
            RecoveryAction::StripTrailingCommas => {
                let path = &target.config_path;
                let text = tokio::fs::read_to_string(path).await.map_err(io_error)?;
                let count = TRAILING_COMMA.find_iter(&text).count();
                if count > 0 {
                    let fixed = TRAILING_COMMA.replace_all(&text, "$1").into_owned();
                    write_atomic(path, fixed).await?;
                }
                Ok(format!("removed {count} trailing commas"))
            }
            RecoveryAction::PurgeDirectory { path } => {
                let dir = contained(&target.work_dir, path)?;
                match tokio::fs::remove_dir_all(&dir).await {
                    Ok(()) => Ok(format!("purged {}", dir.display())),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        Ok(format!("{} already absent", dir.display()))
                    }
                    Err(e) => Err(io_error(e)),
                }
            }
        }
    }
}

fn io_error(e: std::io::Error) -> StepError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StepError::permanent(e.to_string())
    } else {
        StepError::transient(e.to_string())
    }
}

/// Resolve `relative` below `root`, refusing anything that escapes it
fn contained(root: &Path, relative: &str) -> Result<PathBuf, StepError> {
    let rel = Path::new(relative);
    let escapes = rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || relative.is_empty() {
        return Err(StepError::permanent(format!("refusing to touch `{relative}` outside the working directory")));
    }
    Ok(root.join(rel))
}

async fn read_document(path: &Path) -> Result<Value, StepError> {
    let text = tokio::fs::read_to_string(path).await.map_err(io_error)?;
    match ConfigFormat::from_path(path) {
        ConfigFormat::Json => serde_json::from_str(&text).map_err(|e| StepError::permanent(e.to_string())),
        ConfigFormat::Yaml => serde_yaml::from_str(&text).map_err(|e| StepError::permanent(e.to_string())),
        ConfigFormat::Hcl => Err(StepError::permanent("HCL templates cannot be edited structurally")),
    }
}

async fn write_document(path: &Path, doc: &Value) -> Result<(), StepError> {
    let text = match ConfigFormat::from_path(path) {
        ConfigFormat::Yaml => serde_yaml::to_string(doc).map_err(|e| StepError::permanent(e.to_string()))?,
        _ => {
            let mut s = serde_json::to_string_pretty(doc).map_err(|e| StepError::permanent(e.to_string()))?;
            s.push('\n');
            s
        }
    };
    write_atomic(path, text).await
}

/// Replace `path` through a sibling temp file so readers never see a torn write
async fn write_atomic(path: &Path, text: String) -> Result<(), StepError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = path
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_error)?;
        tmp.write_all(text.as_bytes()).map_err(io_error)?;
        tmp.persist(&path).map_err(|e| io_error(e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| StepError::transient(format!("write task failed: {e}")))?
}

/// Parse a Go-style duration such as `90s`, `5m` or `1h30m`
fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if text == "0" {
        return Some(Duration::ZERO);
    }
    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let value: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        let unit = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let secs = match &rest[..unit] {
            "h" => value.checked_mul(3_600)?,
            "m" => value.checked_mul(60)?,
            "s" => value,
            _ => return None,
        };
        total = total.checked_add(Duration::from_secs(secs))?;
        rest = &rest[unit..];
    }
    Some(total)
}

/// Raise each builder's communicator timeout to `floor`; returns the keys changed
///
/// Docker builders and builders without a network communicator are skipped.
/// Values that do not parse are left for a human.
fn raise_timeouts(doc: &mut Value, minimum: &str, floor: Duration) -> Vec<String> {
    let mut raised = Vec::new();
    let Some(builders) = doc.get_mut("builders").and_then(Value::as_array_mut) else {
        return raised;
    };
    for (idx, builder) in builders.iter_mut().enumerate() {
        let Some(obj) = builder.as_object_mut() else {
            continue;
        };
        let communicator = obj.get("communicator").and_then(Value::as_str).unwrap_or("ssh");
        if obj.get("type").and_then(Value::as_str) == Some("docker")
            || matches!(communicator, "none" | "docker")
        {
            continue;
        }
        let key = if obj.contains_key("winrm_timeout") || communicator == "winrm" {
            "winrm_timeout"
        } else {
            "ssh_timeout"
        };
        let too_short = match obj.get(key) {
            None => true,
            Some(current) => current
                .as_str()
                .and_then(parse_duration)
                .is_some_and(|d| d < floor),
        };
        if too_short {
            obj.insert(key.to_string(), Value::String(minimum.to_string()));
            raised.push(format!("builders[{idx}].{key}"));
        }
    }
    raised
}

/// Set the value at a JSON pointer, creating the last object key if needed
fn set_pointer(doc: &mut Value, pointer: &str, value: Value) -> Result<(), StepError> {
    let missing = || StepError::permanent(format!("no parent for pointer {pointer}"));
    let (parent, last) = pointer.rsplit_once('/').ok_or_else(missing)?;
    let key = last.replace("~1", "/").replace("~0", "~");
    match doc.pointer_mut(parent).ok_or_else(missing)? {
        Value::Object(map) => {
            map.insert(key, value);
            Ok(())
        }
        Value::Array(items) if key == "-" => {
            items.push(value);
            Ok(())
        }
        Value::Array(items) => {
            let slot = key
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get_mut(i))
                .ok_or_else(missing)?;
            *slot = value;
            Ok(())
        }
        _ => Err(missing()),
    }
}

/// File contents captured before a step ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub step_id: String,
    pub path: PathBuf,
    /// `None` if the file did not exist
    #[serde(with = "hex_bytes")]
    pub contents: Option<Vec<u8>>,
}

impl Backup {
    /// Capture `path` as it is now
    ///
    /// # Errors
    /// [`RecoveryError::Io`] for anything but a missing file.
    pub fn capture(step_id: &str, path: &Path) -> Result<Self, RecoveryError> {
        let contents = match std::fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(RecoveryError::io(path, e)),
        };
        debug!(step = step_id, path = %path.display(), "snapshot taken");
        Ok(Self {
            step_id: step_id.to_string(),
            path: path.to_path_buf(),
            contents,
        })
    }

    /// Put the captured bytes back
    ///
    /// # Errors
    /// [`RecoveryError::Io`] if the file cannot be replaced.
    pub fn restore(&self) -> Result<(), RecoveryError> {
        let Some(bytes) = &self.contents else {
            return match std::fs::remove_file(&self.path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(RecoveryError::io(&self.path, e)),
                _ => Ok(()),
            };
        };
        let dir = self
            .path
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| RecoveryError::io(dir, e))?;
        tmp.write_all(bytes).map_err(|e| RecoveryError::io(tmp.path(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| RecoveryError::io(&self.path, e.error))?;
        Ok(())
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|h| hex::decode(h).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(action: RecoveryAction) -> RecoveryStep {
        RecoveryStep {
            id: "step-1".into(),
            action,
            timeout_ms: 1_000,
            retries: 0,
        }
    }

    fn target(dir: &Path, text: &str) -> RecoveryTarget {
        let path = dir.join("template.json");
        std::fs::write(&path, text).unwrap();
        RecoveryTarget::for_config(path)
    }

    #[tokio::test]
    async fn set_field_creates_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let t = target(dir.path(), r#"{"builders": [{"type": "amazon-ebs"}]}"#);
        let action = RecoveryAction::SetField {
            pointer: "/builders/0/ssh_timeout".into(),
            value: "10m".into(),
        };
        FileStepExecutor.execute(&step(action), &t).await.unwrap();
        let doc: Value = serde_json::from_str(&std::fs::read_to_string(&t.config_path).unwrap()).unwrap();
        assert_eq!(doc["builders"][0]["ssh_timeout"], "10m");
    }

    #[tokio::test]
    async fn set_field_without_parent_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let t = target(dir.path(), r#"{"builders": []}"#);
        let action = RecoveryAction::SetField {
            pointer: "/builders/3/ssh_timeout".into(),
            value: "10m".into(),
        };
        let err = FileStepExecutor.execute(&step(action), &t).await.unwrap_err();
        assert!(!err.transient);
    }

    #[tokio::test]
    async fn add_provisioner_prepends() {
        let dir = tempfile::tempdir().unwrap();
        let t = target(dir.path(), r#"{"provisioners": [{"type": "file"}]}"#);
        let action = RecoveryAction::AddProvisioner {
            inline: vec!["sudo apt-get update".into()],
        };
        FileStepExecutor.execute(&step(action), &t).await.unwrap();
        let doc: Value = serde_json::from_str(&std::fs::read_to_string(&t.config_path).unwrap()).unwrap();
        assert_eq!(doc["provisioners"][0]["type"], "shell");
        assert_eq!(doc["provisioners"][1]["type"], "file");
    }

    #[tokio::test]
    async fn short_communicator_timeouts_are_raised() {
        let dir = tempfile::tempdir().unwrap();
        let t = target(
            dir.path(),
            r#"{"builders": [
                {"type": "amazon-ebs", "ssh_timeout": "30s"},
                {"type": "azure-arm", "communicator": "winrm", "winrm_timeout": "2m"},
                {"type": "amazon-ebs", "name": "long", "ssh_timeout": "1h"},
                {"type": "amazon-instance"},
                {"type": "docker", "ssh_timeout": "5s"},
                {"type": "null", "communicator": "none"}
            ]}"#,
        );
        let action = RecoveryAction::RaiseCommunicatorTimeout {
            minimum: "10m".into(),
        };
        let msg = FileStepExecutor.execute(&step(action.clone()), &t).await.unwrap();
        assert!(msg.contains("builders[0].ssh_timeout"));
        let doc: Value = serde_json::from_str(&std::fs::read_to_string(&t.config_path).unwrap()).unwrap();
        assert_eq!(doc["builders"][0]["ssh_timeout"], "10m");
        assert_eq!(doc["builders"][1]["winrm_timeout"], "10m");
        assert!(doc["builders"][1].get("ssh_timeout").is_none());
        assert_eq!(doc["builders"][2]["ssh_timeout"], "1h");
        assert_eq!(doc["builders"][3]["ssh_timeout"], "10m");
        assert_eq!(doc["builders"][4]["ssh_timeout"], "5s");
        assert!(doc["builders"][5].get("ssh_timeout").is_none());

        let again = FileStepExecutor.execute(&step(action), &t).await.unwrap();
        assert_eq!(again, "communicator timeouts already sufficient");
    }

    #[test]
    fn go_durations() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("1m30s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7_200)));
        assert_eq!(parse_duration("0"), Some(Duration::ZERO));
        assert_eq!(parse_duration("ten minutes"), None);
        assert_eq!(parse_duration("5"), None);
        assert_eq!(parse_duration("m"), None);
    }

    #[tokio::test]
    async fn strip_trailing_commas_keeps_everything_else() {
        let dir = tempfile::tempdir().unwrap();
        let t = target(dir.path(), "{\n  \"a\": [1, 2,],\n  \"b\": {\"c\": 1,}\n}\n");
        let msg = FileStepExecutor
            .execute(&step(RecoveryAction::StripTrailingCommas), &t)
            .await
            .unwrap();
        assert!(msg.contains('2'));
        let text = std::fs::read_to_string(&t.config_path).unwrap();
        assert_eq!(text, "{\n  \"a\": [1, 2],\n  \"b\": {\"c\": 1}\n}\n");
    }

    #[tokio::test]
    async fn purge_stays_inside_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let t = target(dir.path(), "{}");
        std::fs::create_dir_all(dir.path().join("packer_cache/iso")).unwrap();
        let purge = |p: &str| step(RecoveryAction::PurgeDirectory { path: p.into() });

        FileStepExecutor.execute(&purge("packer_cache"), &t).await.unwrap();
        assert!(!dir.path().join("packer_cache").exists());
        assert!(FileStepExecutor.execute(&purge("../etc"), &t).await.is_err());
        assert!(FileStepExecutor.execute(&purge("/etc"), &t).await.is_err());
    }

    #[test]
    fn backup_restores_bytes_and_absence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.json");
        std::fs::write(&path, b"{ \"x\": 1 }\r\n").unwrap();
        let backup = Backup::capture("s", &path).unwrap();
        std::fs::write(&path, b"changed").unwrap();
        backup.restore().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{ \"x\": 1 }\r\n");

        let absent = Backup::capture("s", &dir.path().join("new.json")).unwrap();
        std::fs::write(&absent.path, b"created").unwrap();
        absent.restore().unwrap();
        assert!(!absent.path.exists());
    }

    #[test]
    fn backup_serializes_as_hex() {
        let backup = Backup {
            step_id: "s".into(),
            path: "f".into(),
            contents: Some(vec![0xde, 0xad]),
        };
        let json = serde_json::to_string(&backup).unwrap();
        assert!(json.contains("\"dead\""));
        let back: Backup = serde_json::from_str(&json).unwrap();
        assert_eq!(back, backup);
    }
}
