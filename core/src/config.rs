//! The declarative sandbox policy and its JSON settings file.

use crate::error::Result;
use crate::error::SandboxError;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

pub const DEFAULT_SETTINGS_FILE: &str = ".vsbx-settings.json";

/// Files that must never become writable inside the sandbox, wherever they
/// appear under the working directory.
pub const DANGEROUS_FILES: &[&str] = &[
    ".gitconfig",
    ".bashrc",
    ".zshrc",
    ".ripgreprc",
    ".mcp.json",
];

/// Directories that must never become writable inside the sandbox.
pub const DANGEROUS_DIRECTORIES: &[&str] = &[
    ".vscode",
    ".idea",
    ".vsbx/commands",
    ".vsbx/agents",
];

pub const GIT_HOOKS_DIR: &str = ".git/hooks";
pub const GIT_CONFIG_FILE: &str = ".git/config";

/// Paths that stay writable under any write restriction.
pub fn default_writable_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("/dev/stdout"),
        PathBuf::from("/dev/stderr"),
        PathBuf::from("/dev/null"),
        PathBuf::from("/dev/tty"),
        PathBuf::from("/dev/dtracehelper"),
        PathBuf::from("/dev/autofs_nowait"),
        PathBuf::from("/tmp/vsbx"),
        PathBuf::from("/private/tmp/vsbx"),
    ];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".npm/_logs"));
        paths.push(home.join(".vsbx/debug"));
    }
    paths
}

/// Default path of the settings file (`~/.vsbx-settings.json`).
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(DEFAULT_SETTINGS_FILE))
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<FilesystemConfig>,
    /// Map of command substring -> violation paths to suppress. The key
    /// `"*"` applies to every command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_violations: Option<HashMap<String, Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_weaker_nested_sandbox: Option<bool>,
    /// Recursion depth for the dangerous-file scan on Linux (1..=10).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mandatory_deny_search_depth: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_pty: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ripgrep: Option<RipgrepConfig>,
}

pub const DEFAULT_MANDATORY_DENY_SEARCH_DEPTH: u8 = 3;

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NetworkConfig {
    /// An empty-but-present list blocks all destinations; an absent field
    /// inherits the manager's base policy. The distinction is observable,
    /// hence the `Option<Vec<_>>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_domains: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub denied_domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_unix_sockets: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_all_unix_sockets: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_local_binding: Option<bool>,
    /// Use an externally managed HTTP proxy instead of starting one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy_port: Option<u16>,
    /// Use an externally managed SOCKS proxy instead of starting one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socks_proxy_port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FilesystemConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny_read: Vec<String>,
    /// Present (possibly empty) list switches writes to allow-list mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_write: Option<Vec<String>>,
    /// Carve-outs inside the allow-write set; overrides allow-write.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny_write: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_git_config: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RipgrepConfig {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
}

impl Default for RipgrepConfig {
    fn default() -> Self {
        Self {
            command: "rg".to_string(),
            args: None,
        }
    }
}

impl PolicyConfig {
    /// True when connections must go through the filtering proxies.
    pub fn network_restricted(&self) -> bool {
        self.network
            .as_ref()
            .is_some_and(|n| n.allowed_domains.is_some() || !n.denied_domains.is_empty())
    }

    /// True when writes are allow-list only.
    pub fn write_restricted(&self) -> bool {
        self.filesystem
            .as_ref()
            .is_some_and(|f| f.allow_write.is_some())
    }

    pub fn read_restricted(&self) -> bool {
        self.filesystem
            .as_ref()
            .is_some_and(|f| !f.deny_read.is_empty())
    }

    /// When nothing is restricted the wrapper returns the command verbatim.
    pub fn has_restrictions(&self) -> bool {
        self.network_restricted() || self.read_restricted() || self.write_restricted()
    }

    pub fn allow_all_unix_sockets(&self) -> bool {
        self.network
            .as_ref()
            .and_then(|n| n.allow_all_unix_sockets)
            .unwrap_or(false)
    }

    pub fn allow_git_config(&self) -> bool {
        self.filesystem
            .as_ref()
            .and_then(|f| f.allow_git_config)
            .unwrap_or(false)
    }

    pub fn mandatory_deny_search_depth(&self) -> u8 {
        self.mandatory_deny_search_depth
            .unwrap_or(DEFAULT_MANDATORY_DENY_SEARCH_DEPTH)
    }

    /// Overlay a partial config onto this one. Precedence is per subkey:
    /// a subkey present in `overlay` replaces the base subkey wholesale.
    pub fn merged_with(&self, overlay: &PolicyConfig) -> PolicyConfig {
        PolicyConfig {
            network: overlay.network.clone().or_else(|| self.network.clone()),
            filesystem: overlay
                .filesystem
                .clone()
                .or_else(|| self.filesystem.clone()),
            ignore_violations: overlay
                .ignore_violations
                .clone()
                .or_else(|| self.ignore_violations.clone()),
            enable_weaker_nested_sandbox: overlay
                .enable_weaker_nested_sandbox
                .or(self.enable_weaker_nested_sandbox),
            mandatory_deny_search_depth: overlay
                .mandatory_deny_search_depth
                .or(self.mandatory_deny_search_depth),
            allow_pty: overlay.allow_pty.or(self.allow_pty),
            ripgrep: overlay.ripgrep.clone().or_else(|| self.ripgrep.clone()),
        }
    }

    /// Validate field contents, collecting every diagnostic rather than
    /// stopping at the first.
    pub fn validate(&self) -> Result<()> {
        let mut diagnostics = Vec::new();

        if let Some(network) = &self.network {
            for domain in network.allowed_domains.iter().flatten() {
                if let Err(reason) = validate_domain_pattern(domain) {
                    diagnostics.push(format!("network.allowedDomains: {reason}"));
                }
            }
            for domain in &network.denied_domains {
                if let Err(reason) = validate_domain_pattern(domain) {
                    diagnostics.push(format!("network.deniedDomains: {reason}"));
                }
            }
            for socket in network.allow_unix_sockets.iter().flatten() {
                if socket.trim().is_empty() {
                    diagnostics.push("network.allowUnixSockets: path must be non-empty".into());
                }
            }
        }

        if let Some(filesystem) = &self.filesystem {
            let pattern_lists = [
                ("filesystem.denyRead", &filesystem.deny_read),
                ("filesystem.denyWrite", &filesystem.deny_write),
            ];
            for (field, patterns) in pattern_lists {
                for pattern in patterns {
                    if pattern.trim().is_empty() {
                        diagnostics.push(format!("{field}: path pattern must be non-empty"));
                    }
                }
            }
            for pattern in filesystem.allow_write.iter().flatten() {
                if pattern.trim().is_empty() {
                    diagnostics.push("filesystem.allowWrite: path pattern must be non-empty".into());
                }
            }
            if filesystem.allow_write.is_none() && !filesystem.deny_write.is_empty() {
                tracing::warn!(
                    "filesystem.denyWrite has no effect without filesystem.allowWrite"
                );
            }
        }

        if let Some(depth) = self.mandatory_deny_search_depth {
            if !(1..=10).contains(&depth) {
                diagnostics.push(format!(
                    "mandatoryDenySearchDepth: {depth} is out of range (expected 1..=10)"
                ));
            }
        }

        if diagnostics.is_empty() {
            Ok(())
        } else {
            Err(SandboxError::InvalidConfig { diagnostics })
        }
    }
}

/// Strict domain-pattern syntax: `localhost`, a dotted name with at least
/// two labels, or `*.` followed by a dotted name with at least two labels.
/// Schemes, ports, slashes, and any other wildcard placement are rejected.
pub fn validate_domain_pattern(pattern: &str) -> std::result::Result<(), String> {
    if pattern.is_empty() {
        return Err("domain pattern must be non-empty".to_string());
    }
    let lower = pattern.to_ascii_lowercase();
    if lower == "localhost" {
        return Ok(());
    }
    let body = lower.strip_prefix("*.").unwrap_or(&lower);
    if body.contains('*') || body.contains('?') {
        return Err(format!(
            "\"{pattern}\": wildcards are only allowed as a leading \"*.\""
        ));
    }
    if body.contains('/') {
        return Err(format!("\"{pattern}\": domain patterns cannot contain paths"));
    }
    if body.contains(':') {
        return Err(format!(
            "\"{pattern}\": domain patterns cannot contain schemes or ports"
        ));
    }
    let labels: Vec<&str> = body.split('.').collect();
    if labels.len() < 2 {
        return Err(format!(
            "\"{pattern}\": expected a dotted name with at least two labels"
        ));
    }
    for label in labels {
        if label.is_empty() {
            return Err(format!("\"{pattern}\": empty label in domain pattern"));
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(format!("\"{pattern}\": invalid character in domain pattern"));
        }
    }
    Ok(())
}

/// Load and validate the settings file. Unknown top-level keys are
/// tolerated for forward compatibility; unknown nested keys fail.
pub fn load_settings(path: &Path) -> Result<PolicyConfig> {
    let raw = std::fs::read_to_string(path).map_err(|err| SandboxError::InvalidConfig {
        diagnostics: vec![format!("unable to read {}: {err}", path.display())],
    })?;
    let config: PolicyConfig =
        serde_json::from_str(&raw).map_err(|err| SandboxError::InvalidConfig {
            diagnostics: vec![format!("unable to parse {}: {err}", path.display())],
        })?;
    config.validate()?;
    Ok(config)
}

/// Load the default settings file when it exists, otherwise an empty policy.
pub fn load_default_settings() -> Result<PolicyConfig> {
    match default_settings_path() {
        Some(path) if path.exists() => load_settings(&path),
        _ => Ok(PolicyConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn validator_accepts_the_documented_forms() {
        for pattern in ["localhost", "x.com", "*.x.com", "api.internal.example.com"] {
            assert!(
                validate_domain_pattern(pattern).is_ok(),
                "{pattern} should be accepted"
            );
        }
    }

    #[test]
    fn validator_rejects_the_documented_forms() {
        for pattern in [
            "", ".com", "com.", "foo*bar.com", "http://x", "x/y", "x:y", "*.x", "**.x.com",
        ] {
            assert!(
                validate_domain_pattern(pattern).is_err(),
                "{pattern} should be rejected"
            );
        }
    }

    #[test]
    fn empty_present_allowlist_restricts_network() {
        let config: PolicyConfig =
            serde_json::from_str(r#"{"network": {"allowedDomains": []}}"#).expect("parse");
        assert!(config.network_restricted());

        let absent: PolicyConfig = serde_json::from_str(r#"{"network": {}}"#).expect("parse");
        assert!(!absent.network_restricted());

        let missing: PolicyConfig = serde_json::from_str("{}").expect("parse");
        assert!(!missing.network_restricted());
    }

    #[test]
    fn unknown_top_level_keys_are_tolerated() {
        let config: PolicyConfig =
            serde_json::from_str(r#"{"futureFeature": true, "network": {}}"#).expect("parse");
        assert!(config.network.is_some());
    }

    #[test]
    fn unknown_nested_keys_fail() {
        let parsed: std::result::Result<PolicyConfig, _> =
            serde_json::from_str(r#"{"network": {"allowedDomainz": []}}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn depth_out_of_range_is_a_diagnostic() {
        let config = PolicyConfig {
            mandatory_deny_search_depth: Some(11),
            ..Default::default()
        };
        let err = config.validate().expect_err("depth 11 must fail");
        assert!(err.to_string().contains("mandatoryDenySearchDepth"));
    }

    #[test]
    fn merge_overlays_per_subkey() {
        let base = PolicyConfig {
            network: Some(NetworkConfig {
                allowed_domains: Some(vec!["x.com".to_string()]),
                ..Default::default()
            }),
            filesystem: Some(FilesystemConfig {
                deny_read: vec!["/secret".to_string()],
                ..Default::default()
            }),
            allow_pty: Some(true),
            ..Default::default()
        };
        let overlay = PolicyConfig {
            network: Some(NetworkConfig {
                allowed_domains: Some(vec![]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let merged = base.merged_with(&overlay);
        // Present network subkey replaces the base one wholesale.
        assert_eq!(
            merged.network.as_ref().and_then(|n| n.allowed_domains.clone()),
            Some(vec![])
        );
        // Absent subkeys inherit.
        assert_eq!(merged.filesystem, base.filesystem);
        assert_eq!(merged.allow_pty, Some(true));
    }

    #[test]
    fn wrap_fast_path_requires_no_restrictions() {
        let unrestricted = PolicyConfig {
            filesystem: Some(FilesystemConfig {
                deny_read: vec![],
                allow_write: None,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!unrestricted.has_restrictions());

        let restricted = PolicyConfig {
            filesystem: Some(FilesystemConfig {
                allow_write: Some(vec![]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(restricted.has_restrictions());
        assert!(restricted.write_restricted());
    }
}
