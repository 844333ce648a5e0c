//! Seatbelt profile compilation for macOS.
//!
//! The profile is handed to `/usr/bin/sandbox-exec -p` as a single
//! S-expression program: a fixed preamble, network rules aimed at the
//! filtering proxies, deny-read rules, allow-list write rules, and the
//! rename-resistant ancestor denials that keep `mv` from carrying a
//! restricted path out from under its rule.

use crate::config::PolicyConfig;
use crate::mandatory_deny::literal_deny_paths;
use crate::paths::ancestor_directories;
use crate::paths::contains_glob_chars;
use crate::paths::normalize_path_pattern;
use crate::proxy_env::proxy_env;
use crate::shell_quote::ShellToken;
use crate::shell_quote::join_tokens;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;

const MACOS_SEATBELT_BASE_POLICY: &str = include_str!("seatbelt_base_policy.sbpl");

/// Only consider `sandbox-exec` in /usr/bin to defend against a malicious
/// version injected on the PATH.
pub const MACOS_PATH_TO_SEATBELT_EXECUTABLE: &str = "/usr/bin/sandbox-exec";

/// How much of the command is carried in the log tag.
pub const LOG_TAG_COMMAND_BYTES: usize = 100;

#[derive(Debug, Clone)]
pub struct SeatbeltParams<'a> {
    pub command: &'a str,
    pub shell: &'a str,
    pub config: &'a PolicyConfig,
    pub cwd: &'a Path,
    pub http_proxy_port: Option<u16>,
    pub socks_proxy_port: Option<u16>,
    pub session_suffix: &'a str,
}

/// Base64 of the first [`LOG_TAG_COMMAND_BYTES`] bytes of the command;
/// the key that correlates log-stream violations back to a command.
pub fn encoded_command(command: &str) -> String {
    let bytes = command.as_bytes();
    let head = &bytes[..bytes.len().min(LOG_TAG_COMMAND_BYTES)];
    BASE64.encode(head)
}

/// The tag embedded in every deny rule's `with message` clause.
pub fn log_tag(command: &str, session_suffix: &str) -> String {
    format!(
        "CMD64_{}_END_{session_suffix}",
        encoded_command(command)
    )
}

/// The complete wrapped command: `env … sandbox-exec -p <profile>
/// <shell> -c <command>`, shell-quoted into one string.
pub fn wrap_command(params: &SeatbeltParams) -> String {
    let profile = build_profile(params);

    let mut tokens = vec![ShellToken::literal("env")];
    if params.config.network_restricted() {
        if let (Some(http_port), Some(socks_port)) =
            (params.http_proxy_port, params.socks_proxy_port)
        {
            for (key, value) in proxy_env(http_port, socks_port) {
                tokens.push(ShellToken::literal(format!("{key}={value}")));
            }
            tokens.push(ShellToken::literal(format!(
                "GIT_SSH_COMMAND=ssh -o ProxyCommand='nc -X 5 -x localhost:{socks_port} %h %p'"
            )));
        }
    }
    tokens.push(ShellToken::literal(MACOS_PATH_TO_SEATBELT_EXECUTABLE));
    tokens.push(ShellToken::literal("-p"));
    tokens.push(ShellToken::literal(profile));
    tokens.push(ShellToken::literal(params.shell));
    tokens.push(ShellToken::literal("-c"));
    tokens.push(ShellToken::literal(params.command));
    join_tokens(&tokens)
}

pub fn build_profile(params: &SeatbeltParams) -> String {
    let tag = log_tag(params.command, params.session_suffix);
    let mut profile = String::from(MACOS_SEATBELT_BASE_POLICY);

    profile.push_str("\n; Network\n");
    network_rules(&mut profile, params);

    profile.push_str("\n; Reads\n");
    read_rules(&mut profile, params, &tag);

    profile.push_str("\n; Writes\n");
    write_rules(&mut profile, params, &tag);

    if params.config.allow_pty.unwrap_or(false) {
        profile.push_str("\n; Pseudo-terminals\n");
        profile.push_str("(allow pseudo-tty)\n");
        profile.push_str("(allow file-ioctl (regex #\"^/dev/ttys\"))\n");
        profile.push_str("(allow file-read* (regex #\"^/dev/ttys\"))\n");
        profile.push_str("(allow file-write* (regex #\"^/dev/ttys\"))\n");
    }

    profile
}

fn network_rules(profile: &mut String, params: &SeatbeltParams) {
    if !params.config.network_restricted() {
        profile.push_str("(allow network*)\n");
        return;
    }
    let network = params.config.network.as_ref();

    if network.and_then(|n| n.allow_local_binding).unwrap_or(false) {
        profile.push_str("(allow network-bind (local ip \"localhost:*\"))\n");
        profile.push_str("(allow network-inbound (local ip \"localhost:*\"))\n");
        profile.push_str("(allow network-outbound (remote ip \"localhost:*\"))\n");
    }

    if params.config.allow_all_unix_sockets() {
        profile.push_str("(allow network* (subpath \"/\"))\n");
    } else if let Some(sockets) = network.and_then(|n| n.allow_unix_sockets.as_ref()) {
        let mut seen = BTreeSet::new();
        for socket in sockets {
            let normalized = normalize_path_pattern(socket, params.cwd);
            if seen.insert(normalized.clone()) {
                profile.push_str(&format!(
                    "(allow network* (subpath \"{}\"))\n",
                    escape_sbpl_string(&normalized)
                ));
            }
        }
    }

    for port in [params.http_proxy_port, params.socks_proxy_port]
        .into_iter()
        .flatten()
    {
        profile.push_str(&format!(
            "(allow network-outbound (remote ip \"localhost:{port}\"))\n"
        ));
        profile.push_str(&format!(
            "(allow network-inbound (local ip \"localhost:{port}\"))\n"
        ));
        profile.push_str(&format!(
            "(allow network-bind (local ip \"localhost:{port}\"))\n"
        ));
    }
}

fn read_rules(profile: &mut String, params: &SeatbeltParams, tag: &str) {
    profile.push_str("(allow file-read*)\n");
    let Some(filesystem) = params.config.filesystem.as_ref() else {
        return;
    };
    for pattern in &filesystem.deny_read {
        let normalized = normalize_path_pattern(pattern, params.cwd);
        if contains_glob_chars(&normalized) {
            profile.push_str(&format!(
                "(deny file-read* (regex #\"{}\") (with message \"{tag}\"))\n",
                glob_to_regex(&normalized)
            ));
        } else {
            profile.push_str(&format!(
                "(deny file-read* (subpath \"{}\") (with message \"{tag}\"))\n",
                escape_sbpl_string(&normalized)
            ));
            ancestor_unlink_rules(profile, &normalized, tag);
        }
    }
}

fn write_rules(profile: &mut String, params: &SeatbeltParams, tag: &str) {
    let filesystem = params.config.filesystem.as_ref();
    let Some(allow_write) = filesystem.and_then(|f| f.allow_write.as_ref()) else {
        profile.push_str("(allow file-write*)\n");
        return;
    };

    // Hardwired safe writes stay available under any restriction.
    for path in crate::config::default_writable_paths() {
        profile.push_str(&format!(
            "(allow file-write* (subpath \"{}\"))\n",
            escape_sbpl_string(&path.to_string_lossy())
        ));
    }
    for root in tmpdir_write_roots() {
        profile.push_str(&format!(
            "(allow file-write* (subpath \"{}\"))\n",
            escape_sbpl_string(&root.to_string_lossy())
        ));
    }

    for pattern in allow_write {
        let normalized = normalize_path_pattern(pattern, params.cwd);
        if contains_glob_chars(&normalized) {
            profile.push_str(&format!(
                "(allow file-write* (regex #\"{}\"))\n",
                glob_to_regex(&normalized)
            ));
        } else {
            profile.push_str(&format!(
                "(allow file-write* (subpath \"{}\"))\n",
                escape_sbpl_string(&normalized)
            ));
        }
    }

    let deny_within_allow = filesystem
        .map(|f| f.deny_write.as_slice())
        .unwrap_or_default();
    for pattern in deny_within_allow {
        let normalized = normalize_path_pattern(pattern, params.cwd);
        deny_write_rule(profile, &normalized, tag);
    }

    for path in literal_deny_paths(params.cwd, params.config.allow_git_config()) {
        deny_write_rule(profile, &path.to_string_lossy(), tag);
    }
}

fn deny_write_rule(profile: &mut String, normalized: &str, tag: &str) {
    if contains_glob_chars(normalized) {
        profile.push_str(&format!(
            "(deny file-write* (regex #\"{}\") (with message \"{tag}\"))\n",
            glob_to_regex(normalized)
        ));
    } else {
        profile.push_str(&format!(
            "(deny file-write* (subpath \"{}\") (with message \"{tag}\"))\n",
            escape_sbpl_string(normalized)
        ));
        ancestor_unlink_rules(profile, normalized, tag);
    }
}

/// Renaming any ancestor of a denied path would expose the target under a
/// fresh name, so unlink/rename is denied on the whole chain up to root.
fn ancestor_unlink_rules(profile: &mut String, denied_path: &str, tag: &str) {
    profile.push_str(&format!(
        "(deny file-write-unlink (literal \"{}\") (with message \"{tag}\"))\n",
        escape_sbpl_string(denied_path)
    ));
    for ancestor in ancestor_directories(Path::new(denied_path)) {
        profile.push_str(&format!(
            "(deny file-write-unlink (literal \"{}\") (with message \"{tag}\"))\n",
            escape_sbpl_string(&ancestor.to_string_lossy())
        ));
    }
}

/// The per-user temp tree stays writable in both its `/var` and
/// `/private/var` spellings.
fn tmpdir_write_roots() -> Vec<PathBuf> {
    let Some(tmpdir) = std::env::var_os("TMPDIR") else {
        return Vec::new();
    };
    let tmpdir = PathBuf::from(tmpdir);
    let Some(parent) = tmpdir.parent().map(Path::to_path_buf) else {
        return Vec::new();
    };
    let text = parent.to_string_lossy().to_string();
    let mut roots = vec![parent];
    if let Some(stripped) = text.strip_prefix("/private") {
        roots.push(PathBuf::from(stripped));
    } else if text.starts_with("/var/") {
        roots.push(PathBuf::from(format!("/private{text}")));
    }
    roots
}

fn escape_sbpl_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Translate a normalized glob pattern into a seatbelt regex: `**/` spans
/// zero or more directories, `**` any characters, `*` within one segment,
/// `?` one non-slash character; `[…]` classes pass through.
pub(crate) fn glob_to_regex(pattern: &str) -> String {
    let bytes = pattern.as_bytes();
    let mut out = String::from("^");
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'*' => {
                if bytes.get(i + 1) == Some(&b'*') {
                    if bytes.get(i + 2) == Some(&b'/') {
                        out.push_str("(.*/)?");
                        i += 3;
                    } else {
                        out.push_str(".*");
                        i += 2;
                    }
                } else {
                    out.push_str("[^/]*");
                    i += 1;
                }
            }
            b'?' => {
                out.push_str("[^/]");
                i += 1;
            }
            b'[' => {
                match pattern[i + 1..].find(']') {
                    Some(offset) => {
                        let class = &pattern[i + 1..i + 1 + offset];
                        let class = class.strip_prefix('!').map_or_else(
                            || class.to_string(),
                            |negated| format!("^{negated}"),
                        );
                        out.push('[');
                        out.push_str(&class);
                        out.push(']');
                        i += offset + 2;
                    }
                    None => {
                        out.push_str("\\[");
                        i += 1;
                    }
                }
            }
            _ => {
                let c = pattern[i..].chars().next().unwrap_or('\u{fffd}');
                if matches!(
                    c,
                    '.' | '+' | '(' | ')' | '|' | '^' | '$' | '{' | '}' | '\\'
                ) {
                    out.push('\\');
                }
                if c == '"' {
                    out.push('\\');
                }
                out.push(c);
                i += c.len_utf8();
            }
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilesystemConfig;
    use crate::config::NetworkConfig;
    use pretty_assertions::assert_eq;

    fn params<'a>(config: &'a PolicyConfig, command: &'a str) -> SeatbeltParams<'a> {
        SeatbeltParams {
            command,
            shell: "/bin/bash",
            config,
            cwd: Path::new("/work"),
            http_proxy_port: Some(3128),
            socks_proxy_port: Some(1080),
            session_suffix: "feedface",
        }
    }

    #[test]
    fn glob_translation_matches_the_documented_rules() {
        assert_eq!(glob_to_regex("/a/*.txt"), "^/a/[^/]*\\.txt$");
        assert_eq!(glob_to_regex("/a/**/b"), "^/a/(.*/)?b$");
        assert_eq!(glob_to_regex("/a/x**"), "^/a/x.*$");
        assert_eq!(glob_to_regex("/a/f?le"), "^/a/f[^/]le$");
        assert_eq!(glob_to_regex("/a/[ab]c"), "^/a/[ab]c$");
        assert_eq!(glob_to_regex("/a/[!ab]c"), "^/a/[^ab]c$");
    }

    #[test]
    fn unrestricted_network_allows_everything() {
        let config = PolicyConfig::default();
        let profile = build_profile(&params(&config, "true"));
        assert!(profile.contains("(allow network*)\n"));
        assert!(profile.contains("(allow file-write*)\n"));
    }

    #[test]
    fn restricted_network_only_reaches_the_proxies() {
        let config = PolicyConfig {
            network: Some(NetworkConfig {
                allowed_domains: Some(vec!["example.com".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let profile = build_profile(&params(&config, "curl https://example.com"));
        assert!(!profile.contains("(allow network*)\n"));
        assert!(profile.contains("(allow network-outbound (remote ip \"localhost:3128\"))"));
        assert!(profile.contains("(allow network-outbound (remote ip \"localhost:1080\"))"));
        assert!(profile.contains("(allow network-bind (local ip \"localhost:3128\"))"));
    }

    #[test]
    fn deny_read_emits_subpath_rule_and_ancestor_tower() {
        let config = PolicyConfig {
            filesystem: Some(FilesystemConfig {
                deny_read: vec!["/T/denied".to_string()],
                ..Default::default()
            }),
            ..Default::default()
        };
        let profile = build_profile(&params(&config, "mv /T/denied/secret /T/public"));
        assert!(profile.contains("(deny file-read* (subpath \"/T/denied\")"));
        assert!(profile.contains("(deny file-write-unlink (literal \"/T/denied\")"));
        assert!(profile.contains("(deny file-write-unlink (literal \"/T\")"));
        // Never a rule on the root itself.
        assert!(!profile.contains("(deny file-write-unlink (literal \"/\")"));
    }

    #[test]
    fn glob_deny_read_becomes_a_regex_rule() {
        let config = PolicyConfig {
            filesystem: Some(FilesystemConfig {
                deny_read: vec!["/T/g/*.txt".to_string()],
                ..Default::default()
            }),
            ..Default::default()
        };
        let profile = build_profile(&params(&config, "cat /T/g/s.txt"));
        assert!(profile.contains("(deny file-read* (regex #\"^/T/g/[^/]*\\.txt$\")"));
    }

    #[test]
    fn empty_allow_write_keeps_only_default_writables() {
        let config = PolicyConfig {
            filesystem: Some(FilesystemConfig {
                allow_write: Some(vec![]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let profile = build_profile(&params(&config, "true"));
        assert!(!profile.contains("(allow file-write*)\n"));
        assert!(profile.contains("(allow file-write* (subpath \"/dev/null\"))"));
        assert!(profile.contains("(allow file-write* (subpath \"/tmp/vsbx\"))"));
    }

    #[test]
    fn mandatory_denies_cover_the_dangerous_names() {
        let config = PolicyConfig {
            filesystem: Some(FilesystemConfig {
                allow_write: Some(vec!["/work".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let profile = build_profile(&params(&config, "true"));
        assert!(profile.contains("(deny file-write* (subpath \"/work/.gitconfig\")"));
        assert!(profile.contains("(deny file-write* (subpath \"/work/.git/hooks\")"));
        assert!(profile.contains("(deny file-write* (subpath \"/work/.git/config\")"));
        assert!(profile.contains("(deny file-write* (subpath \"/work/.vsbx/commands\")"));
    }

    #[test]
    fn allow_git_config_removes_only_that_rule() {
        let config = PolicyConfig {
            filesystem: Some(FilesystemConfig {
                allow_write: Some(vec!["/work".to_string()]),
                allow_git_config: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };
        let profile = build_profile(&params(&config, "true"));
        assert!(!profile.contains("(deny file-write* (subpath \"/work/.git/config\")"));
        assert!(profile.contains("(deny file-write* (subpath \"/work/.git/hooks\")"));
    }

    #[test]
    fn log_tag_encodes_the_first_hundred_bytes() {
        let long_command = "x".repeat(250);
        let tag = log_tag(&long_command, "feedface");
        let expected = BASE64.encode("x".repeat(100).as_bytes());
        assert_eq!(tag, format!("CMD64_{expected}_END_feedface"));
    }

    #[test]
    fn wrapped_command_embeds_the_command_exactly_once() {
        let config = PolicyConfig {
            filesystem: Some(FilesystemConfig {
                deny_read: vec!["/T/denied".to_string()],
                ..Default::default()
            }),
            ..Default::default()
        };
        let command = "cat /T/denied/secret";
        let wrapped = wrap_command(&params(&config, command));
        assert!(wrapped.starts_with("env "));
        assert!(wrapped.contains("/usr/bin/sandbox-exec -p "));
        assert_eq!(wrapped.matches(command).count(), 1);
    }

    #[test]
    fn proxy_env_prefixes_network_restricted_wrappers() {
        let config = PolicyConfig {
            network: Some(NetworkConfig {
                allowed_domains: Some(vec!["example.com".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let wrapped = wrap_command(&params(&config, "curl https://example.com"));
        assert!(wrapped.contains("HTTP_PROXY=http://localhost:3128"));
        assert!(wrapped.contains("ALL_PROXY=socks5h://localhost:1080"));
        assert!(wrapped.contains("GIT_SSH_COMMAND="));
    }

    #[test]
    fn pty_rules_are_opt_in() {
        let without = build_profile(&params(&PolicyConfig::default(), "true"));
        assert!(!without.contains("(allow pseudo-tty)"));

        let config = PolicyConfig {
            allow_pty: Some(true),
            ..Default::default()
        };
        let with = build_profile(&params(&config, "true"));
        assert!(with.contains("(allow pseudo-tty)"));
        assert!(with.contains("(allow file-ioctl (regex #\"^/dev/ttys\"))"));
    }
}
