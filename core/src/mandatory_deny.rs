//! Wrap-time discovery of credential-bearing paths under the working
//! directory, so they can be overlaid read-only inside the write-allowed
//! region on Linux.

use crate::config::DANGEROUS_DIRECTORIES;
use crate::config::DANGEROUS_FILES;
use crate::config::GIT_CONFIG_FILE;
use crate::config::GIT_HOOKS_DIR;
use crate::config::RipgrepConfig;
use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const SCAN_TIMEOUT: Duration = Duration::from_secs(10);
const SCAN_OUTPUT_CAP: usize = 20 * 1024 * 1024;

/// The deny paths that need no filesystem search: the dangerous names
/// anchored directly at the working directory.
pub fn literal_deny_paths(cwd: &Path, allow_git_config: bool) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = DANGEROUS_FILES
        .iter()
        .chain(DANGEROUS_DIRECTORIES.iter())
        .map(|name| cwd.join(name))
        .collect();
    paths.push(cwd.join(GIT_HOOKS_DIR));
    if !allow_git_config {
        paths.push(cwd.join(GIT_CONFIG_FILE));
    }
    paths
}

/// Enumerate dangerous paths under `cwd` up to `depth` using the
/// configured ripgrep. Any failure (missing tool, timeout, oversized
/// output, cancellation) degrades to the literal deny set with a warning;
/// the wrap still proceeds.
pub async fn scan_dangerous_paths(
    cwd: &Path,
    depth: u8,
    ripgrep: Option<&RipgrepConfig>,
    allow_git_config: bool,
    cancel: Option<CancellationToken>,
) -> Vec<PathBuf> {
    let literals = literal_deny_paths(cwd, allow_git_config);

    let scan = run_ripgrep_scan(cwd, depth, ripgrep, allow_git_config);
    let scanned = match cancel {
        Some(token) => {
            tokio::select! {
                _ = token.cancelled() => {
                    warn!("dangerous-file scan cancelled; using literal deny paths only");
                    return literals;
                }
                scanned = scan => scanned,
            }
        }
        None => scan.await,
    };

    match scanned {
        Ok(found) => {
            let mut merged: BTreeSet<PathBuf> = literals.into_iter().collect();
            merged.extend(found);
            merged.into_iter().collect()
        }
        Err(err) => {
            warn!(error = %err, "dangerous-file scan failed; using literal deny paths only");
            literals
        }
    }
}

async fn run_ripgrep_scan(
    cwd: &Path,
    depth: u8,
    ripgrep: Option<&RipgrepConfig>,
    allow_git_config: bool,
) -> anyhow::Result<Vec<PathBuf>> {
    let default_config = RipgrepConfig::default();
    let config = ripgrep.unwrap_or(&default_config);

    let mut command = Command::new(&config.command);
    command
        .arg("--files")
        .arg("--hidden")
        .arg("--no-ignore")
        .arg("--max-depth")
        .arg(depth.to_string());
    for name in DANGEROUS_FILES {
        command.arg("--glob").arg(format!("**/{name}"));
    }
    for dir in DANGEROUS_DIRECTORIES {
        command.arg("--glob").arg(format!("**/{dir}/**"));
    }
    command.arg("--glob").arg(format!("**/{GIT_HOOKS_DIR}/**"));
    if !allow_git_config {
        command.arg("--glob").arg(format!("**/{GIT_CONFIG_FILE}"));
    }
    for arg in config.args.iter().flatten() {
        command.arg(arg);
    }
    command
        .arg(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let child = command.spawn()?;
    let output = tokio::time::timeout(SCAN_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| anyhow::anyhow!("scan timed out after {SCAN_TIMEOUT:?}"))??;

    // ripgrep exits 1 when nothing matched; that is an empty result, not
    // an error.
    if !output.status.success() && output.status.code() != Some(1) {
        anyhow::bail!("ripgrep exited with {}", output.status);
    }

    let mut stdout = output.stdout;
    if stdout.len() > SCAN_OUTPUT_CAP {
        stdout.truncate(SCAN_OUTPUT_CAP);
        // Drop the clipped final line.
        if let Some(newline) = stdout.iter().rposition(|b| *b == b'\n') {
            stdout.truncate(newline);
        }
        warn!("dangerous-file scan output capped at {SCAN_OUTPUT_CAP} bytes");
    }

    let paths = String::from_utf8_lossy(&stdout)
        .lines()
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_set_anchors_dangerous_names_at_cwd() {
        let paths = literal_deny_paths(Path::new("/work"), false);
        assert!(paths.contains(&PathBuf::from("/work/.gitconfig")));
        assert!(paths.contains(&PathBuf::from("/work/.vsbx/commands")));
        assert!(paths.contains(&PathBuf::from("/work/.git/hooks")));
        assert!(paths.contains(&PathBuf::from("/work/.git/config")));
    }

    #[test]
    fn allow_git_config_removes_only_git_config() {
        let with = literal_deny_paths(Path::new("/work"), false);
        let without = literal_deny_paths(Path::new("/work"), true);
        assert!(with.contains(&PathBuf::from("/work/.git/config")));
        assert!(!without.contains(&PathBuf::from("/work/.git/config")));
        assert!(without.contains(&PathBuf::from("/work/.git/hooks")));
        assert_eq!(with.len(), without.len() + 1);
    }

    #[tokio::test]
    async fn missing_tool_degrades_to_literals() {
        let ripgrep = RipgrepConfig {
            command: "/nonexistent/definitely-not-rg".to_string(),
            args: None,
        };
        let cwd = Path::new("/work");
        let paths = scan_dangerous_paths(cwd, 3, Some(&ripgrep), false, None).await;
        assert_eq!(paths, literal_deny_paths(cwd, false));
    }

    #[tokio::test]
    async fn cancellation_degrades_to_literals() {
        let token = CancellationToken::new();
        token.cancel();
        let cwd = Path::new("/work");
        let paths = scan_dangerous_paths(cwd, 3, None, false, Some(token)).await;
        assert_eq!(paths, literal_deny_paths(cwd, false));
    }
}
