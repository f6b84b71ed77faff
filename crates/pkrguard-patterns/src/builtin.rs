//! Built-in pattern catalog
//!
//! Seeds a fresh store. Confidence values are starting points; the learning
//! loop moves them afterwards.

use crate::pattern::{DelusionPattern, PatternKind, Severity};

/// Expression for hardcoded credentials (also used by recovery correlation)
pub const HARDCODED_CREDENTIAL: &str = r"field:(?i).*\.(password|ssh_password|winrm_password|secret|secret_key|client_secret|token|api_key|access_key)=^[^{$]";

/// Expression for communicator timeouts that are too short
pub const SHORT_COMMUNICATOR_TIMEOUT: &str = r"field:.*\.(ssh_timeout|winrm_timeout)=^([0-9]+s|[0-4]m)$";

/// Expression for AWS builders without an SSH timeout
pub const MISSING_SSH_TIMEOUT: &str = "missing:builders[amazon-(ebs|instance)].ssh_timeout";

/// Expression for a communicator logging in as root
pub const ROOT_SSH_USER: &str = r"field:.*\.ssh_username=^root$";

/// Expression for remote scripts piped into a shell
pub const REMOTE_SCRIPT_PIPE: &str = r"text:(curl|wget)[^\n]*\|\s*(sudo\s+)?(ba|z)?sh\b";

/// Expression for references to undeclared variables
pub const UNRESOLVED_VARIABLE: &str = "unresolved-variable";

/// Expression for trailing commas in JSON source
pub const TRAILING_COMMA: &str = r"text:,\s*[}\]]";

/// The full catalog, in a fixed order
#[must_use]
pub fn catalog() -> Vec<DelusionPattern> {
    use PatternKind::{Architecture, Build, Security, Syntax};
    use Severity::{Critical, High, Low, Medium};

    vec![
        DelusionPattern::new(
            Security,
            Critical,
            HARDCODED_CREDENTIAL,
            "Credential stored as a literal in the template",
            "Move the value into a sensitive variable or a secrets manager and reference it with {{user `name`}}",
            0.9,
        ),
        DelusionPattern::new(
            Security,
            Critical,
            r"text:\b(AKIA|ASIA)[0-9A-Z]{16}\b",
            "AWS access key id embedded in the template",
            "Rotate the key and rely on instance profiles or environment credentials",
            0.95,
        ),
        DelusionPattern::new(
            Security,
            Critical,
            r"text:-----BEGIN [A-Z ]*PRIVATE KEY-----",
            "Private key material embedded in the template",
            "Reference a key file through ssh_private_key_file instead of inlining it",
            0.95,
        ),
        DelusionPattern::new(
            Security,
            High,
            r"field:(?i).*(insecure_skip_tls_verify|skip_tls_verify|tls_skip_verify|insecure_connection|insecure)=^true$",
            "TLS certificate verification disabled",
            "Remove the insecure flag and trust the endpoint's CA instead",
            0.85,
        ),
        DelusionPattern::new(
            Security,
            High,
            REMOTE_SCRIPT_PIPE,
            "Remote script piped straight into a shell",
            "Download the script, verify its checksum, then execute it",
            0.8,
        ),
        DelusionPattern::new(
            Security,
            Medium,
            r"text:chmod\s+(-R\s+)?(0?777|a\+w|o\+w)",
            "World-writable permissions set during provisioning",
            "Grant the narrowest mode the service needs (for example 0755 or 0640)",
            0.75,
        ),
        DelusionPattern::new(
            Security,
            Medium,
            ROOT_SSH_USER,
            "Communicator logs in as root",
            "Use an unprivileged user with sudo",
            0.7,
        ),
        DelusionPattern::new(
            Security,
            Medium,
            "missing:builders[(virtualbox|vmware|qemu|hyperv|parallels)-iso].iso_checksum",
            "ISO builder without a checksum",
            "Set iso_checksum so the downloaded image is verified",
            0.8,
        ),
        DelusionPattern::new(
            Security,
            Medium,
            r"field:.*\.iso_checksum=^(none|)$",
            "ISO checksum verification disabled",
            "Provide the real checksum of the ISO",
            0.8,
        ),
        DelusionPattern::new(
            Security,
            Low,
            r"field:.*\.iso_url=^http://",
            "ISO fetched over plain HTTP",
            "Use an HTTPS mirror",
            0.5,
        ),
        DelusionPattern::new(
            Architecture,
            Critical,
            "empty:builders",
            "Template defines no builders",
            "Add at least one builder block",
            0.95,
        ),
        DelusionPattern::new(
            Architecture,
            High,
            "duplicate:builders.name",
            "Two builders share the same name",
            "Give every builder a unique name so -only/-except and logs stay unambiguous",
            0.85,
        ),
        DelusionPattern::new(
            Architecture,
            Low,
            r"field:builders\[\d+\]\.source_ami=^ami-[0-9a-f]{8,17}$",
            "Source AMI pinned to a literal id",
            "Use source_ami_filter or a variable so the base image can be updated per region",
            0.5,
        ),
        DelusionPattern::new(
            Architecture,
            Low,
            "empty:provisioners",
            "Template builds an image without provisioning it",
            "Add the provisioners that configure the image, or document why none are needed",
            0.4,
        ),
        DelusionPattern::new(
            Build,
            High,
            "missing:builders[amazon-(ebs|instance|chroot|ebssurrogate)].ami_name",
            "Amazon builder without ami_name",
            "Set ami_name, usually with a timestamp suffix",
            0.9,
        ),
        DelusionPattern::new(
            Build,
            High,
            UNRESOLVED_VARIABLE,
            "Reference to a variable that is never declared",
            "Declare the variable in the variables block or fix the reference",
            0.85,
        ),
        DelusionPattern::new(
            Build,
            Medium,
            SHORT_COMMUNICATOR_TIMEOUT,
            "Communicator timeout shorter than a typical boot",
            "Raise ssh_timeout/winrm_timeout to at least 5m",
            0.6,
        ),
        DelusionPattern::new(
            Build,
            Low,
            MISSING_SSH_TIMEOUT,
            "Amazon builder relies on the default SSH timeout",
            "Set ssh_timeout explicitly (for example 10m)",
            0.45,
        ),
        DelusionPattern::new(
            Syntax,
            High,
            TRAILING_COMMA,
            "Trailing comma before a closing bracket",
            "Remove the trailing comma",
            0.95,
        ),
        DelusionPattern::new(
            Syntax,
            Medium,
            r"text:\{\{\s*user\s+[^`\s}][^}]*\}\}",
            "Malformed {{user}} reference",
            "Quote the variable name with backticks: {{user `name`}}",
            0.8,
        ),
        DelusionPattern::new(
            Syntax,
            High,
            r"text:(?m)\{\{[^}\n]*$",
            "Unterminated template interpolation",
            "Close the interpolation with }}",
            0.8,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::CompiledPattern;
    use std::collections::HashSet;

    #[test]
    fn catalog_compiles() {
        for pattern in catalog() {
            let id = pattern.id.clone();
            assert!(CompiledPattern::compile(pattern).is_ok(), "pattern {id} failed");
        }
    }

    #[test]
    fn catalog_ids_are_unique() {
        let ids: HashSet<_> = catalog().into_iter().map(|p| p.id).collect();
        assert_eq!(ids.len(), catalog().len());
    }

    #[test]
    fn every_kind_is_covered() {
        let kinds: HashSet<_> = catalog().into_iter().map(|p| p.kind).collect();
        for kind in PatternKind::ALL {
            assert!(kinds.contains(&kind), "no {kind} pattern");
        }
    }
}
