//! Bubblewrap argument construction for Linux.
//!
//! The filesystem view mirrors the macOS profile semantics: reads allowed
//! by default with denied paths masked out, writes allow-list only, and
//! dangerous paths overlaid read-only. Network isolation places the
//! process in a fresh network namespace; the bridge sockets and in-sandbox
//! relays are the only route back to the filtering proxies.

use crate::bridge::BridgeSockets;
use crate::config::PolicyConfig;
use crate::paths::contains_glob_chars;
use crate::paths::normalize_path_pattern;
use crate::proxy_env::proxy_env;
use crate::seccomp::SeccompArtifacts;
use crate::shell_quote::ShellToken;
use crate::shell_quote::join_tokens;
use crate::shell_quote::quote;
use std::path::Path;
use std::path::PathBuf;
use tracing::warn;

/// Fixed in-namespace relay ports. The host-side proxies can sit anywhere;
/// the relays pin these ports inside the sandbox so the proxy environment
/// variables are stable.
pub const SANDBOX_HTTP_PORT: u16 = 3128;
pub const SANDBOX_SOCKS_PORT: u16 = 1080;

const SSH_CONFIG_DROPINS: &str = "/etc/ssh/ssh_config.d";

#[derive(Debug, Clone)]
pub struct BwrapParams<'a> {
    pub command: &'a str,
    pub shell: &'a str,
    pub config: &'a PolicyConfig,
    pub cwd: &'a Path,
    pub bridge_sockets: Option<&'a BridgeSockets>,
    pub seccomp: Option<&'a SeccompArtifacts>,
    /// Output of the mandatory-deny scan (literal paths when the scan
    /// degraded).
    pub scan_overlay_paths: &'a [PathBuf],
}

/// The complete wrapped command: `bwrap <args> -- <shell> -c <inner>`,
/// shell-quoted into one string.
pub fn wrap_command(params: &BwrapParams) -> String {
    let mut tokens = vec![ShellToken::literal("bwrap")];
    for arg in build_args(params) {
        tokens.push(ShellToken::literal(arg));
    }
    join_tokens(&tokens)
}

/// Everything after `bwrap`, including the launch stage.
pub fn build_args(params: &BwrapParams) -> Vec<String> {
    let mut args: Vec<String> = vec!["--new-session".into(), "--die-with-parent".into()];

    let bridged = params.config.network_restricted() && params.bridge_sockets.is_some();
    if params.config.network_restricted() {
        args.push("--unshare-net".into());
        if let Some(sockets) = params.bridge_sockets {
            for socket in [&sockets.http_socket_path, &sockets.socks_socket_path] {
                let socket = socket.to_string_lossy().to_string();
                args.push("--bind".into());
                args.push(socket.clone());
                args.push(socket);
            }
            for (key, value) in proxy_env(SANDBOX_HTTP_PORT, SANDBOX_SOCKS_PORT) {
                args.push("--setenv".into());
                args.push(key);
                args.push(value);
            }
        }
    }

    let writable_roots = filesystem_args(&mut args, params);
    overlay_args(&mut args, params, &writable_roots);
    deny_read_args(&mut args, params);

    args.push("--dev".into());
    args.push("/dev".into());
    args.push("--unshare-pid".into());
    if !params.config.enable_weaker_nested_sandbox.unwrap_or(false) {
        args.push("--proc".into());
        args.push("/proc".into());
    }

    args.push("--".into());
    args.push(params.shell.to_string());
    args.push("-c".into());
    args.push(launch_stage(params, bridged));
    args
}

/// Root bind plus writable binds. Returns the writable roots so the
/// overlay stage can scope itself to them.
fn filesystem_args(args: &mut Vec<String>, params: &BwrapParams) -> Vec<PathBuf> {
    let allow_write = params
        .config
        .filesystem
        .as_ref()
        .and_then(|f| f.allow_write.as_ref());
    let Some(allow_write) = allow_write else {
        args.push("--bind".into());
        args.push("/".into());
        args.push("/".into());
        return Vec::new();
    };

    args.push("--ro-bind".into());
    args.push("/".into());
    args.push("/".into());

    let mut writable_roots = Vec::new();
    for pattern in allow_write {
        let normalized = normalize_path_pattern(pattern, params.cwd);
        if contains_glob_chars(&normalized) {
            warn!(pattern = %pattern, "glob write patterns are not enforceable on linux; dropping");
            continue;
        }
        let path = PathBuf::from(&normalized);
        if !path.exists() {
            warn!(path = %normalized, "allow-write path does not exist; skipping bind");
            continue;
        }
        args.push("--bind".into());
        args.push(normalized.clone());
        args.push(normalized);
        writable_roots.push(path);
    }
    writable_roots
}

/// Re-apply read-only protection over dangerous paths that landed inside a
/// writable root. Mount order matters: these come after the `--bind`s.
fn overlay_args(args: &mut Vec<String>, params: &BwrapParams, writable_roots: &[PathBuf]) {
    if writable_roots.is_empty() {
        return;
    }
    for path in params.scan_overlay_paths {
        if !path.exists() || path.starts_with("/dev") {
            continue;
        }
        if !writable_roots.iter().any(|root| path.starts_with(root)) {
            continue;
        }
        let text = path.to_string_lossy().to_string();
        args.push("--ro-bind".into());
        args.push(text.clone());
        args.push(text);
    }

    let deny_write = params
        .config
        .filesystem
        .as_ref()
        .map(|f| f.deny_write.as_slice())
        .unwrap_or_default();
    for pattern in deny_write {
        let normalized = normalize_path_pattern(pattern, params.cwd);
        if contains_glob_chars(&normalized) {
            warn!(pattern = %pattern, "glob write patterns are not enforceable on linux; dropping");
            continue;
        }
        let path = PathBuf::from(&normalized);
        if !path.exists() {
            continue;
        }
        args.push("--ro-bind".into());
        args.push(normalized.clone());
        args.push(normalized);
    }
}

/// Mask denied reads: a tmpfs hides a directory, a /dev/null bind hides a
/// file.
fn deny_read_args(args: &mut Vec<String>, params: &BwrapParams) {
    let deny_read = params
        .config
        .filesystem
        .as_ref()
        .map(|f| f.deny_read.as_slice())
        .unwrap_or_default();
    for pattern in deny_read {
        let normalized = normalize_path_pattern(pattern, params.cwd);
        if contains_glob_chars(&normalized) {
            warn!(pattern = %pattern, "glob read patterns are not enforceable on linux; dropping");
            continue;
        }
        let path = PathBuf::from(&normalized);
        if !path.exists() {
            continue;
        }
        mask_path(args, &path, &normalized);
    }
    if !deny_read.is_empty() {
        let dropins = Path::new(SSH_CONFIG_DROPINS);
        if dropins.exists() {
            mask_path(args, dropins, SSH_CONFIG_DROPINS);
        }
    }
}

fn mask_path(args: &mut Vec<String>, path: &Path, text: &str) {
    if path.is_dir() {
        args.push("--tmpfs".into());
        args.push(text.to_string());
    } else {
        args.push("--ro-bind".into());
        args.push("/dev/null".into());
        args.push(text.to_string());
    }
}

/// The inner `-c` payload. With bridges: spawn the TCP→UNIX relays, arm an
/// EXIT trap for them, then exec into the seccomp applier (the relays need
/// AF_UNIX, so seccomp must come after they start). Without bridges the
/// applier, when available, wraps the shell directly.
fn launch_stage(params: &BwrapParams, bridged: bool) -> String {
    let exec_tail = match params.seccomp {
        Some(artifacts) => format!(
            "{} {} {} -c {}",
            quote(&artifacts.applier_path.to_string_lossy()),
            quote(&artifacts.bpf_path.to_string_lossy()),
            quote(params.shell),
            quote(params.command)
        ),
        None => format!("{} -c {}", quote(params.shell), quote(params.command)),
    };

    if !bridged {
        return match params.seccomp {
            Some(_) => format!("exec {exec_tail}"),
            None => params.command.to_string(),
        };
    }

    let sockets = match params.bridge_sockets {
        Some(sockets) => sockets,
        None => return format!("exec {exec_tail}"),
    };
    let http_socket = quote(&sockets.http_socket_path.to_string_lossy());
    let socks_socket = quote(&sockets.socks_socket_path.to_string_lossy());
    format!(
        "socat TCP-LISTEN:{http_port},fork UNIX-CONNECT:{http_socket} &\n\
         socat TCP-LISTEN:{socks_port},fork UNIX-CONNECT:{socks_socket} &\n\
         trap 'kill $(jobs -p) 2>/dev/null' EXIT\n\
         exec {exec_tail}",
        http_port = SANDBOX_HTTP_PORT,
        socks_port = SANDBOX_SOCKS_PORT,
    )
}
