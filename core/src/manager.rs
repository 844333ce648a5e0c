//! Process-wide sandbox lifecycle: one-shot proxy/bridge initialization,
//! command wrapping, and teardown.
//!
//! The state machine is idle → initializing → ready → (reset) → idle.
//! `initializing` is an in-flight shared future that concurrent callers
//! join, so two parallel `initialize` calls produce one set of proxies.

use crate::bridge::BridgeSockets;
use crate::bridge::LinuxBridge;
use crate::bwrap;
use crate::bwrap::BwrapParams;
use crate::config::PolicyConfig;
use crate::error::Result;
use crate::error::SandboxError;
use crate::log_monitor::LogMonitor;
use crate::mandatory_deny::scan_dangerous_paths;
use crate::network_filter::AskCallback;
use crate::network_filter::PolicyHostFilter;
use crate::seatbelt;
use crate::seatbelt::SeatbeltParams;
use crate::seccomp;
use crate::violations::ViolationStore;
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::future::Shared;
use rand::Rng;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::RwLock;
use tracing::debug;
use tracing::warn;
use vsbx_network_proxy::HostFilter;
use vsbx_network_proxy::HttpProxy;
use vsbx_network_proxy::SocksProxy;

pub const DEFAULT_SHELL: &str = "/bin/bash";

type InitFuture = Shared<BoxFuture<'static, Result<Arc<ManagerContext>>>>;

/// Everything established by a successful initialization.
pub struct ManagerContext {
    pub http_proxy_port: u16,
    pub socks_proxy_port: u16,
    pub bridge_sockets: Option<BridgeSockets>,
    proxies: TokioMutex<ProxyHandles>,
    bridge: TokioMutex<Option<LinuxBridge>>,
}

#[derive(Default)]
struct ProxyHandles {
    http: Option<HttpProxy>,
    socks: Option<SocksProxy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Idle,
    Initializing,
    Ready,
}

pub struct SandboxManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: Arc<RwLock<PolicyConfig>>,
    init: StdMutex<Option<InitFuture>>,
    context: StdMutex<Option<Arc<ManagerContext>>>,
    /// Serializes initialization bodies and resets against each other.
    lifecycle: TokioMutex<()>,
    violations: ViolationStore,
    log_monitor: TokioMutex<Option<LogMonitor>>,
    cleanup_registered: AtomicBool,
    session_suffix: String,
    ask: Option<AskCallback>,
}

impl SandboxManager {
    pub fn new(config: PolicyConfig) -> Result<Self> {
        Self::with_ask_callback(config, None)
    }

    /// `ask` is consulted by the network filter when neither domain list
    /// matches a destination.
    pub fn with_ask_callback(config: PolicyConfig, ask: Option<AskCallback>) -> Result<Self> {
        config.validate()?;
        let session_suffix = format!("{:08x}", rand::rng().random::<u32>());
        Ok(Self {
            inner: Arc::new(ManagerInner {
                config: Arc::new(RwLock::new(config)),
                init: StdMutex::new(None),
                context: StdMutex::new(None),
                lifecycle: TokioMutex::new(()),
                violations: ViolationStore::new(),
                log_monitor: TokioMutex::new(None),
                cleanup_registered: AtomicBool::new(false),
                session_suffix,
                ask,
            }),
        })
    }

    /// Verify the host can run the sandbox at all. Missing seccomp
    /// artifacts only warn (the sandbox runs without Unix-socket
    /// blocking); everything else here is fatal.
    pub fn preflight(config: &PolicyConfig) -> Result<()> {
        let platform = std::env::consts::OS;
        if !matches!(platform, "macos" | "linux") {
            return Err(SandboxError::UnsupportedPlatform(platform.to_string()));
        }

        let mut missing = Vec::new();
        let ripgrep_command = config
            .ripgrep
            .as_ref()
            .map(|r| r.command.clone())
            .unwrap_or_else(|| "rg".to_string());
        if which::which(&ripgrep_command).is_err() {
            missing.push(ripgrep_command);
        }

        if platform == "linux" {
            for tool in ["bwrap", "socat"] {
                if which::which(tool).is_err() {
                    missing.push(tool.to_string());
                }
            }
            if !config.allow_all_unix_sockets() {
                match seccomp::artifact_arch() {
                    Some(_) => {
                        if seccomp::locate_artifacts().is_none() {
                            warn!(
                                "seccomp artifacts missing; continuing without unix-socket blocking"
                            );
                        }
                    }
                    None => missing.push(format!(
                        "seccomp artifacts for architecture {}",
                        std::env::consts::ARCH
                    )),
                }
            }
        }

        if platform == "macos"
            && !Path::new(seatbelt::MACOS_PATH_TO_SEATBELT_EXECUTABLE).exists()
        {
            missing.push("sandbox-exec".to_string());
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(SandboxError::MissingDependency { tools: missing })
        }
    }

    pub fn state(&self) -> ManagerState {
        if lock_unpoisoned(&self.inner.context).is_some() {
            ManagerState::Ready
        } else if lock_unpoisoned(&self.inner.init).is_some() {
            ManagerState::Initializing
        } else {
            ManagerState::Idle
        }
    }

    pub fn violations(&self) -> ViolationStore {
        self.inner.violations.clone()
    }

    pub async fn config(&self) -> PolicyConfig {
        self.inner.config.read().await.clone()
    }

    /// Replace the base policy. Running proxies pick the change up on the
    /// next connection; an in-flight wrap keeps its merged snapshot.
    pub async fn update_config(&self, config: PolicyConfig) -> Result<()> {
        config.validate()?;
        *self.inner.config.write().await = config;
        Ok(())
    }

    /// Bring up proxies (and the bridge on Linux) exactly once. Concurrent
    /// callers join the same in-flight attempt; a failed attempt releases
    /// every partial resource before re-raising.
    pub async fn initialize(&self) -> Result<Arc<ManagerContext>> {
        if let Some(context) = lock_unpoisoned(&self.inner.context).clone() {
            return Ok(context);
        }
        let future = {
            let mut slot = match self.inner.init.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            match slot.as_ref() {
                Some(future) => future.clone(),
                None => {
                    let weak = Arc::downgrade(&self.inner);
                    let future: InitFuture = async move {
                        let inner = weak.upgrade().ok_or_else(|| {
                            SandboxError::Initialization("manager dropped".to_string())
                        })?;
                        ManagerInner::do_initialize(inner).await
                    }
                    .boxed()
                    .shared();
                    *slot = Some(future.clone());
                    future
                }
            }
        };
        future.await
    }

    /// Produce the wrapped command for the manager's policy.
    pub async fn wrap(&self, command: &str) -> Result<String> {
        self.wrap_with(command, None, None).await
    }

    /// Wrap with an optional shell override and a partial policy overlay
    /// merged per subkey on top of the base policy.
    pub async fn wrap_with(
        &self,
        command: &str,
        shell: Option<&str>,
        overlay: Option<PolicyConfig>,
    ) -> Result<String> {
        if let Some(overlay) = overlay.as_ref() {
            overlay.validate()?;
        }
        let base = self.inner.config.read().await.clone();
        let config = match overlay {
            Some(overlay) => base.merged_with(&overlay),
            None => base,
        };

        if !config.has_restrictions() {
            debug!("no restrictions apply; returning command unchanged");
            return Ok(command.to_string());
        }

        let shell = shell.unwrap_or(DEFAULT_SHELL);
        let cwd = std::env::current_dir()?;

        // Network mediation needs listening proxies (and bridge sockets on
        // Linux) before the wrapper can reference them.
        let context = if config.network_restricted() {
            Some(self.initialize().await?)
        } else {
            lock_unpoisoned(&self.inner.context).clone()
        };

        match std::env::consts::OS {
            "macos" => Ok(seatbelt::wrap_command(&SeatbeltParams {
                command,
                shell,
                config: &config,
                cwd: &cwd,
                http_proxy_port: context.as_ref().map(|c| c.http_proxy_port),
                socks_proxy_port: context.as_ref().map(|c| c.socks_proxy_port),
                session_suffix: &self.inner.session_suffix,
            })),
            "linux" => {
                let scan_overlay_paths = if config.write_restricted() {
                    scan_dangerous_paths(
                        &cwd,
                        config.mandatory_deny_search_depth(),
                        config.ripgrep.as_ref(),
                        config.allow_git_config(),
                        None,
                    )
                    .await
                } else {
                    Vec::new()
                };
                let seccomp_artifacts = if config.allow_all_unix_sockets() {
                    None
                } else {
                    seccomp::locate_artifacts()
                };
                let bridge_sockets = context.as_ref().and_then(|c| c.bridge_sockets.clone());
                Ok(bwrap::wrap_command(&BwrapParams {
                    command,
                    shell,
                    config: &config,
                    cwd: &cwd,
                    bridge_sockets: bridge_sockets.as_ref(),
                    seccomp: seccomp_artifacts.as_ref(),
                    scan_overlay_paths: &scan_overlay_paths,
                }))
            }
            other => Err(SandboxError::UnsupportedPlatform(other.to_string())),
        }
    }

    /// Append the violations recorded for this command, if any, inside a
    /// `<sandbox_violations>` block.
    pub fn annotate_stderr(&self, command: &str, stderr: &str) -> String {
        let encoded = seatbelt::encoded_command(command);
        let hits = self.inner.violations.for_encoded_command(&encoded);
        if hits.is_empty() {
            return stderr.to_string();
        }
        let mut annotated = stderr.to_string();
        if !annotated.is_empty() && !annotated.ends_with('\n') {
            annotated.push('\n');
        }
        annotated.push_str("<sandbox_violations>\n");
        for event in hits {
            annotated.push_str(&event.line);
            annotated.push('\n');
        }
        annotated.push_str("</sandbox_violations>\n");
        annotated
    }

    /// Tear everything down. Safe to call twice; the second call finds
    /// nothing to release.
    pub async fn reset(&self) {
        ManagerInner::teardown(&self.inner).await;
    }
}

impl ManagerInner {
    async fn do_initialize(inner: Arc<ManagerInner>) -> Result<Arc<ManagerContext>> {
        let _lifecycle = inner.lifecycle.lock().await;
        let config = inner.config.read().await.clone();

        let result = Self::start_services(&inner, &config).await;
        match result {
            Ok(context) => {
                *lock_unpoisoned_mut(&inner.context) = Some(context.clone());
                lock_unpoisoned_mut(&inner.init).take();
                Self::register_cleanup(&inner);
                Ok(context)
            }
            Err(err) => {
                lock_unpoisoned_mut(&inner.init).take();
                Err(err)
            }
        }
    }

    async fn start_services(
        inner: &Arc<ManagerInner>,
        config: &PolicyConfig,
    ) -> Result<Arc<ManagerContext>> {
        SandboxManager::preflight(config)?;

        let filter: Arc<dyn HostFilter> =
            Arc::new(PolicyHostFilter::new(inner.config.clone(), inner.ask.clone()));
        let network = config.network.as_ref();

        let mut http_proxy = None;
        let http_proxy_port = match network.and_then(|n| n.http_proxy_port) {
            Some(port) => port,
            None => {
                let proxy = HttpProxy::start(filter.clone())
                    .await
                    .map_err(|err| SandboxError::ProxyStartup(err.to_string()))?;
                let port = proxy.port();
                http_proxy = Some(proxy);
                port
            }
        };

        let mut socks_proxy = None;
        let socks_proxy_port = match network.and_then(|n| n.socks_proxy_port) {
            Some(port) => port,
            None => match SocksProxy::start(filter.clone()).await {
                Ok(proxy) => {
                    let port = proxy.port();
                    socks_proxy = Some(proxy);
                    port
                }
                Err(err) => {
                    Self::close_services(http_proxy, None, None).await;
                    return Err(SandboxError::ProxyStartup(err.to_string()));
                }
            },
        };

        let mut bridge = None;
        if cfg!(target_os = "linux") {
            match LinuxBridge::start(http_proxy_port, socks_proxy_port).await {
                Ok(started) => bridge = Some(started),
                Err(err) => {
                    Self::close_services(http_proxy, socks_proxy, None).await;
                    return Err(err);
                }
            }
        }

        if cfg!(target_os = "macos") {
            match LogMonitor::start(
                &inner.session_suffix,
                inner.violations.clone(),
                inner.config.clone(),
            )
            .await
            {
                Ok(monitor) => *inner.log_monitor.lock().await = Some(monitor),
                Err(err) => warn!(error = %err, "violation monitor unavailable"),
            }
        }

        let bridge_sockets = bridge.as_ref().map(|b| b.sockets().clone());
        Ok(Arc::new(ManagerContext {
            http_proxy_port,
            socks_proxy_port,
            bridge_sockets,
            proxies: TokioMutex::new(ProxyHandles {
                http: http_proxy,
                socks: socks_proxy,
            }),
            bridge: TokioMutex::new(bridge),
        }))
    }

    async fn close_services(
        http: Option<HttpProxy>,
        socks: Option<SocksProxy>,
        bridge: Option<LinuxBridge>,
    ) {
        if let Some(bridge) = bridge {
            bridge.shutdown().await;
        }
        if let Some(http) = http {
            http.close().await;
        }
        if let Some(socks) = socks {
            socks.close().await;
        }
    }

    async fn teardown(inner: &Arc<ManagerInner>) {
        let _lifecycle = inner.lifecycle.lock().await;
        lock_unpoisoned_mut(&inner.init).take();
        let context = lock_unpoisoned_mut(&inner.context).take();

        if let Some(monitor) = inner.log_monitor.lock().await.take() {
            monitor.stop().await;
        }
        if let Some(context) = context {
            let bridge = context.bridge.lock().await.take();
            let mut proxies = context.proxies.lock().await;
            Self::close_services(proxies.http.take(), proxies.socks.take(), bridge).await;
        }
    }

    /// Best-effort teardown on SIGINT/SIGTERM so bridge relays and socket
    /// files do not outlive the process. Registered once per manager.
    fn register_cleanup(inner: &Arc<ManagerInner>) {
        if inner.cleanup_registered.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            let mut terminate =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(_) => return,
                };
            let mut interrupt =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
                    Ok(signal) => signal,
                    Err(_) => return,
                };
            tokio::select! {
                _ = terminate.recv() => {}
                _ = interrupt.recv() => {}
            }
            if let Some(inner) = weak.upgrade() {
                ManagerInner::teardown(&inner).await;
            }
        });
    }
}

fn lock_unpoisoned<T: Clone>(mutex: &StdMutex<Option<T>>) -> Option<T> {
    match mutex.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn lock_unpoisoned_mut<T>(mutex: &StdMutex<Option<T>>) -> std::sync::MutexGuard<'_, Option<T>> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
