//! macOS system-log monitor feeding the violation store.
//!
//! Deny rules carry a `with message "CMD64_<b64>_END_<session>"` clause, so
//! every violation surfaces in the unified log tagged with the session
//! suffix and the originating command. This module tails `log stream`
//! filtered on that suffix and parses the denials back out.

use crate::config::PolicyConfig;
use crate::error::Result;
use crate::error::SandboxError;
use crate::violations::SandboxViolationEvent;
use crate::violations::ViolationStore;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

/// Denials every macOS process trips over; never worth reporting.
const NOISE_FILTERS: &[&str] = &[
    "mDNSResponder",
    "mach-lookup com.apple.diagnosticd",
    "mach-lookup com.apple.analyticsd",
];

pub struct LogMonitor {
    child: Child,
    reader: JoinHandle<()>,
}

impl LogMonitor {
    /// Spawn `log stream` filtered by the session suffix and parse its
    /// output into the store until stopped.
    pub async fn start(
        session_suffix: &str,
        store: ViolationStore,
        config: Arc<RwLock<PolicyConfig>>,
    ) -> Result<Self> {
        let predicate = format!("eventMessage ENDSWITH \"{session_suffix}\"");
        let mut child = Command::new("log")
            .arg("stream")
            .arg("--style")
            .arg("syslog")
            .arg("--predicate")
            .arg(predicate)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| SandboxError::Io(format!("failed to spawn log stream: {err}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Io("log stream has no stdout".to_string()))?;

        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(event) = parse_line(&line) {
                            if should_ignore(&event, &*config.read().await) {
                                debug!(line = %event.line, "ignoring filtered violation");
                                continue;
                            }
                            store.record(event);
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(error = %err, "log stream read failed");
                        break;
                    }
                }
            }
        });

        Ok(Self { child, reader })
    }

    pub async fn stop(mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
        self.reader.abort();
    }
}

/// Extract a violation from one log line. The line must mention both
/// `Sandbox:` and `deny`; the command tag is optional.
pub(crate) fn parse_line(line: &str) -> Option<SandboxViolationEvent> {
    let sandbox_at = line.find("Sandbox:")?;
    if !line.contains("deny") {
        return None;
    }
    let detail = line[sandbox_at + "Sandbox:".len()..].trim().to_string();

    let encoded_command = extract_tag(line);
    let command = encoded_command.as_deref().and_then(|encoded| {
        BASE64
            .decode(encoded)
            .ok()
            .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
    });

    Some(SandboxViolationEvent {
        line: detail,
        command,
        encoded_command,
        timestamp: Utc::now(),
    })
}

fn extract_tag(line: &str) -> Option<String> {
    let start = line.find("CMD64_")? + "CMD64_".len();
    let rest = &line[start..];
    let end = rest.find("_END_")?;
    Some(rest[..end].to_string())
}

/// Built-in noise, the wildcard ignore list, and per-command ignore lists
/// (keyed by a substring of the decoded command) all suppress an event.
fn should_ignore(event: &SandboxViolationEvent, config: &PolicyConfig) -> bool {
    if NOISE_FILTERS.iter().any(|noise| event.line.contains(noise)) {
        return true;
    }
    let Some(ignore_lists) = config.ignore_violations.as_ref() else {
        return false;
    };
    for (command_pattern, paths) in ignore_lists {
        let applies = command_pattern == "*"
            || event
                .command
                .as_deref()
                .is_some_and(|command| command.contains(command_pattern));
        if applies && paths.iter().any(|path| event.line.contains(path)) {
            return true;
        }
    }
    false
}
