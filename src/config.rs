//! Router configuration.
//!
//! Loadable from JSON; every field has a default so partial documents work.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, RouteError};
use crate::types::{Mode, ModeDecision, Network, ResolveStrategy, TextRule, UdpFqdnStrategy};

/// Default resolver name for direct traffic.
pub const DEFAULT_DIRECT_RESOLVER: &str = "direct";
/// Default resolver name for proxied traffic.
pub const DEFAULT_PROXY_RESOLVER: &str = "proxy";
/// Resolver name used for blocked traffic.
pub const BLOCK_RESOLVER: &str = "block";

/// Dispatcher settings plus the two rule sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Default mode for TCP connections.
    pub tcp: Mode,
    /// Default mode for UDP sessions.
    pub udp: Mode,
    /// Pre-resolve proxied hostnames before handing them to the proxy.
    pub resolve_locally: bool,
    /// Whether IPv6 is usable; without it lookups prefer IPv4.
    pub ipv6: bool,
    /// Global default for forwarding proxied UDP hostnames unresolved.
    pub udp_proxy_fqdn: UdpFqdnStrategy,
    pub direct_resolver: String,
    pub proxy_resolver: String,
    pub rule_file: Option<PathBuf>,
    pub custom_rules: Vec<CustomRule>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            tcp: Mode::Bypass,
            udp: Mode::Bypass,
            resolve_locally: false,
            ipv6: false,
            udp_proxy_fqdn: UdpFqdnStrategy::Default,
            direct_resolver: DEFAULT_DIRECT_RESOLVER.to_string(),
            proxy_resolver: DEFAULT_PROXY_RESOLVER.to_string(),
            rule_file: None,
            custom_rules: Vec::new(),
        }
    }
}

impl RouterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse configuration from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading router configuration from {:?}", path);

        let contents = std::fs::read_to_string(path).map_err(|e| {
            RouteError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            RouteError::ConfigError(format!("Failed to parse JSON: {e} at {path:?}"))
        })
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Default mode for a transport.
    pub fn network_mode(&self, network: Network) -> Mode {
        match network {
            Network::Tcp => self.tcp,
            Network::Udp => self.udp,
        }
    }

    /// Resolver name used when a decision does not name one.
    pub fn fallback_resolver(&self, mode: Mode) -> &str {
        match mode {
            Mode::Proxy => self.proxy_resolver.as_str(),
            Mode::Direct => self.direct_resolver.as_str(),
            Mode::Block => BLOCK_RESOLVER,
            Mode::Bypass => "",
        }
    }

    pub fn with_network_modes(mut self, tcp: Mode, udp: Mode) -> Self {
        self.tcp = tcp;
        self.udp = udp;
        self
    }

    pub fn with_resolve_locally(mut self, enabled: bool) -> Self {
        self.resolve_locally = enabled;
        self
    }

    pub fn with_ipv6(mut self, enabled: bool) -> Self {
        self.ipv6 = enabled;
        self
    }

    pub fn with_udp_proxy_fqdn(mut self, strategy: UdpFqdnStrategy) -> Self {
        self.udp_proxy_fqdn = strategy;
        self
    }

    pub fn with_rule_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.rule_file = Some(path.into());
        self
    }

    pub fn with_custom_rule(mut self, rule: CustomRule) -> Self {
        self.custom_rules.push(rule);
        self
    }
}

/// User-entered rule: several patterns sharing one decision.
///
/// Patterns accept the same `file:` and `process:` prefixes as rule files.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomRule {
    pub hostnames: Vec<String>,
    pub mode: Mode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub resolve_strategy: ResolveStrategy,
    pub udp_proxy_fqdn: UdpFqdnStrategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolver: Option<String>,
}

impl CustomRule {
    pub fn new<I, S>(mode: Mode, hostnames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hostnames: hostnames.into_iter().map(Into::into).collect(),
            mode,
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_resolve_strategy(mut self, strategy: ResolveStrategy) -> Self {
        self.resolve_strategy = strategy;
        self
    }

    pub fn with_udp_proxy_fqdn(mut self, strategy: UdpFqdnStrategy) -> Self {
        self.udp_proxy_fqdn = strategy;
        self
    }

    pub fn with_resolver(mut self, resolver: impl Into<String>) -> Self {
        self.resolver = Some(resolver.into());
        self
    }

    pub fn decision(&self) -> ModeDecision {
        let mut decision = ModeDecision::new(self.mode)
            .with_resolve_strategy(self.resolve_strategy)
            .with_udp_fqdn_strategy(self.udp_proxy_fqdn);
        if let Some(tag) = &self.tag {
            decision = decision.with_tag(tag.as_str());
        }
        if let Some(resolver) = &self.resolver {
            decision = decision.with_resolver(resolver.as_str());
        }
        decision
    }

    /// One [`TextRule`] per pattern.
    pub fn to_text_rules(&self) -> Vec<TextRule> {
        let decision = self.decision();
        self.hostnames
            .iter()
            .map(|pattern| TextRule::new(pattern.trim(), decision.clone()))
            .collect()
    }
}
