//! TCP↔Unix-socket relays that expose the host-side proxies to a process
//! inside an isolated network namespace.
//!
//! The sandboxed side runs `socat TCP-LISTEN:<fixed port> → UNIX-CONNECT`
//! against a socket file bind-mounted into the namespace; this module owns
//! the host side: `UNIX-LISTEN:<socket> → TCP:localhost:<proxy port>`.

use crate::error::Result;
use crate::error::SandboxError;
use rand::Rng;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Child;
use tokio::process::Command;
use tracing::debug;
use tracing::warn;

const READINESS_ATTEMPTS: u32 = 5;
const SIGKILL_ESCALATION: Duration = Duration::from_secs(5);

/// The socket paths the sandboxed process connects to, bind-mounted into
/// the namespace by the bubblewrap builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSockets {
    pub http_socket_path: PathBuf,
    pub socks_socket_path: PathBuf,
}

/// Both relay processes plus their socket files. Lives exactly as long as
/// the manager context; reset kills the relays and unlinks the sockets.
pub struct LinuxBridge {
    sockets: BridgeSockets,
    http_relay: Child,
    socks_relay: Child,
    pub http_proxy_port: u16,
    pub socks_proxy_port: u16,
}

impl LinuxBridge {
    pub async fn start(http_proxy_port: u16, socks_proxy_port: u16) -> Result<Self> {
        let id: u64 = rand::rng().random();
        let tmp = std::env::temp_dir();
        let sockets = BridgeSockets {
            http_socket_path: tmp.join(format!("vsbx-http-{id:016x}.sock")),
            socks_socket_path: tmp.join(format!("vsbx-socks-{id:016x}.sock")),
        };

        let mut http_relay = spawn_relay(&sockets.http_socket_path, http_proxy_port)?;
        if let Err(err) = wait_for_socket(&mut http_relay, &sockets.http_socket_path).await {
            teardown_relay(http_relay, &sockets.http_socket_path).await;
            return Err(err);
        }

        let mut socks_relay = spawn_relay(&sockets.socks_socket_path, socks_proxy_port)?;
        if let Err(err) = wait_for_socket(&mut socks_relay, &sockets.socks_socket_path).await {
            teardown_relay(socks_relay, &sockets.socks_socket_path).await;
            teardown_relay(http_relay, &sockets.http_socket_path).await;
            return Err(err);
        }

        debug!(
            http_socket = %sockets.http_socket_path.display(),
            socks_socket = %sockets.socks_socket_path.display(),
            "network bridge ready"
        );
        Ok(Self {
            sockets,
            http_relay,
            socks_relay,
            http_proxy_port,
            socks_proxy_port,
        })
    }

    pub fn sockets(&self) -> &BridgeSockets {
        &self.sockets
    }

    /// Kill both relays (SIGTERM, SIGKILL after 5 s) and unlink the socket
    /// files. ESRCH and unlink races are swallowed.
    pub async fn shutdown(self) {
        let LinuxBridge {
            sockets,
            http_relay,
            socks_relay,
            ..
        } = self;
        teardown_relay(http_relay, &sockets.http_socket_path).await;
        teardown_relay(socks_relay, &sockets.socks_socket_path).await;
    }
}

fn spawn_relay(socket_path: &Path, proxy_port: u16) -> Result<Child> {
    let listen = format!(
        "UNIX-LISTEN:{},fork,reuseaddr",
        socket_path.to_string_lossy()
    );
    let connect =
        format!("TCP:localhost:{proxy_port},keepalive,keepidle=10,keepintvl=5,keepcnt=3");
    Command::new("socat")
        .arg(listen)
        .arg(connect)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| SandboxError::BridgeStartup(format!("failed to spawn socat: {err}")))
}

/// Poll for the socket file with a growing delay (attempt `i` waits
/// `100·i` ms). A relay that exits before its socket appears fails the
/// bridge immediately.
async fn wait_for_socket(relay: &mut Child, socket_path: &Path) -> Result<()> {
    for attempt in 1..=READINESS_ATTEMPTS {
        tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
        if socket_path.exists() {
            return Ok(());
        }
        if let Ok(Some(status)) = relay.try_wait() {
            return Err(SandboxError::BridgeStartup(format!(
                "relay for {} exited with {status} before its socket appeared",
                socket_path.display()
            )));
        }
    }
    Err(SandboxError::BridgeStartup(format!(
        "socket {} did not appear after {READINESS_ATTEMPTS} attempts",
        socket_path.display()
    )))
}

async fn teardown_relay(mut relay: Child, socket_path: &Path) {
    if let Some(pid) = relay.id() {
        // SIGTERM first so socat can unlink its socket; ESRCH is fine.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        match tokio::time::timeout(SIGKILL_ESCALATION, relay.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(pid, "relay ignored SIGTERM; escalating to SIGKILL");
                let _ = relay.start_kill();
                let _ = relay.wait().await;
            }
        }
    }
    let _ = std::fs::remove_file(socket_path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn relay_that_dies_immediately_fails_the_bridge() {
        // `socat` with a bogus port would still listen; simulate a dead
        // relay with a child that exits at once.
        let mut child = Command::new("true")
            .stdin(Stdio::null())
            .spawn()
            .expect("spawn true");
        let socket = std::env::temp_dir().join("vsbx-test-nonexistent.sock");
        let result = wait_for_socket(&mut child, &socket).await;
        assert!(matches!(result, Err(SandboxError::BridgeStartup(_))));
    }

    #[tokio::test]
    async fn readiness_returns_once_the_socket_exists() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let socket = tmp.path().join("ready.sock");
        std::fs::write(&socket, b"").expect("create socket placeholder");
        let mut child = Command::new("sleep")
            .arg("5")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .expect("spawn sleep");
        wait_for_socket(&mut child, &socket)
            .await
            .expect("socket is present");
        let _ = child.start_kill();
    }
}
