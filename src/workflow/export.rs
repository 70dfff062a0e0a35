//! Credential-stripping workflow export
//!
//! Produces the same YAML dialect the importer reads, minus anything that
//! looks like a secret: sensitive environment keys are omitted and
//! `credential_ref` values are replaced with a placeholder the importer
//! of the exported file must fill back in.

use crate::error::Result;
use crate::workflow::{TransportConfig, Workflow};

/// Substrings that mark an upper-cased env key as sensitive.
const SENSITIVE_KEY_PATTERNS: &[&str] = &[
    "KEY",
    "SECRET",
    "TOKEN",
    "PASSWORD",
    "CREDENTIAL",
    "PRIVATE",
    "PASSPHRASE",
    "AUTH",
    "BEARER",
    "OAUTH",
];

/// Exact upper-cased env keys that are sensitive without matching a pattern.
const SENSITIVE_KEY_EXACT: &[&str] = &["DATABASE_URL", "DB_URL", "CONNECTION_STRING", "CONN_STR"];

/// Placeholder written in place of a stripped `credential_ref`.
pub const CREDENTIAL_REF_PLACEHOLDER: &str = "<CREDENTIAL_REF_REQUIRED>";

const STRIPPED_COMMENT: &str = "# credentials stripped during export; restore before running";

/// True if an env key must not appear in an exported workflow.
pub fn is_sensitive_key(key: &str) -> bool {
    let upper = key.to_uppercase();
    SENSITIVE_KEY_EXACT.contains(&upper.as_str())
        || SENSITIVE_KEY_PATTERNS.iter().any(|p| upper.contains(p))
}

/// Serialize a workflow to YAML with credentials stripped.
///
/// Returns the YAML text; servers that lost credentials get a comment
/// injected above their declaration.
pub fn export_sanitized(workflow: &Workflow) -> Result<String> {
    let mut sanitized = workflow.clone();
    let mut stripped_ids = Vec::new();

    for server in &mut sanitized.servers {
        let mut stripped = false;

        if let TransportConfig::Stdio { env, .. } = &mut server.transport {
            let before = env.len();
            env.retain(|key, _| !is_sensitive_key(key));
            stripped |= env.len() != before;
        }

        if server.credential_ref.is_some() {
            server.credential_ref = Some(CREDENTIAL_REF_PLACEHOLDER.to_string());
            stripped = true;
        }

        if stripped {
            stripped_ids.push(server.id.clone());
        }
    }

    let yaml = sanitized.to_yaml()?;
    Ok(inject_comments(&yaml, &stripped_ids))
}

/// Insert the stripped-credentials comment above each affected server
/// declaration. serde_yaml cannot emit comments, so this is a text pass
/// over the rendered document.
fn inject_comments(yaml: &str, stripped_ids: &[String]) -> String {
    if stripped_ids.is_empty() {
        return yaml.to_string();
    }

    let mut out = String::with_capacity(yaml.len() + stripped_ids.len() * 64);
    let mut in_servers = false;

    for line in yaml.lines() {
        if !line.starts_with(' ') {
            in_servers = line.starts_with("servers:");
        }

        if in_servers {
            if let Some(id) = line.trim().strip_prefix("- id: ") {
                if stripped_ids.iter().any(|s| s == id.trim()) {
                    let indent: String =
                        line.chars().take_while(|c| c.is_whitespace()).collect();
                    out.push_str(&indent);
                    out.push_str(STRIPPED_COMMENT);
                    out.push('\n');
                }
            }
        }

        out.push_str(line);
        out.push('\n');
    }
    out
}
