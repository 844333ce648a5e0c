//! Admission decisions for proxied connections.

use crate::config::NetworkConfig;
use crate::config::PolicyConfig;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use tracing::warn;
use vsbx_network_proxy::HostFilter;
use wildmatch::WildMatchPattern;

/// Optional interactive callback consulted when neither list matches.
pub type AskCallback =
    Arc<dyn Fn(String, u16) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

/// Case-insensitive domain-pattern match. `*.x.com` matches strict
/// subdomains of `x.com`; the apex must be listed on its own.
pub fn matches_domain_pattern(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return false;
    }
    let matcher: WildMatchPattern<'*', '?'> = WildMatchPattern::new_case_insensitive(pattern);
    matcher.matches(host)
}

/// Decide whether `host:port` may be contacted. Deny list first, then the
/// allow list, then the interactive callback (a callback error denies),
/// and deny otherwise. An absent network policy denies everything: this
/// function is only reached when the sandbox mediates the network.
pub async fn filter_host(
    host: &str,
    port: u16,
    network: Option<&NetworkConfig>,
    ask: Option<&AskCallback>,
) -> bool {
    let Some(network) = network else {
        return false;
    };

    if network
        .denied_domains
        .iter()
        .any(|pattern| matches_domain_pattern(pattern, host))
    {
        debug!(host, port, "denied by denylist");
        return false;
    }

    if network
        .allowed_domains
        .iter()
        .flatten()
        .any(|pattern| matches_domain_pattern(pattern, host))
    {
        return true;
    }

    if let Some(ask) = ask {
        return match ask(host.to_string(), port).await {
            Ok(answer) => answer,
            Err(err) => {
                warn!(host, port, error = %err, "ask callback failed; denying");
                false
            }
        };
    }

    debug!(host, port, "no matching rule; denying");
    false
}

/// [`HostFilter`] backed by the manager's live policy, so config updates
/// apply to connections opened after the update.
pub struct PolicyHostFilter {
    config: Arc<RwLock<PolicyConfig>>,
    ask: Option<AskCallback>,
}

impl PolicyHostFilter {
    pub fn new(config: Arc<RwLock<PolicyConfig>>, ask: Option<AskCallback>) -> Self {
        Self { config, ask }
    }
}

#[async_trait]
impl HostFilter for PolicyHostFilter {
    async fn allow(&self, host: &str, port: u16) -> bool {
        let network = self.config.read().await.network.clone();
        filter_host(host, port, network.as_ref(), self.ask.as_ref()).await
    }
}
