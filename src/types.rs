use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RouteError};

/// Transport of a connection being routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing mode.
///
/// `Bypass` is the "undecided" sentinel: a stage returning it lets the
/// next stage decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Bypass,
    Direct,
    Proxy,
    Block,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Bypass => "bypass",
            Mode::Direct => "direct",
            Mode::Proxy => "proxy",
            Mode::Block => "block",
        }
    }

    /// True for the undecided sentinel.
    pub fn is_bypass(&self) -> bool {
        matches!(self, Mode::Bypass)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bypass" => Ok(Mode::Bypass),
            "direct" => Ok(Mode::Direct),
            "proxy" => Ok(Mode::Proxy),
            "block" => Ok(Mode::Block),
            other => Err(RouteError::InvalidRule(format!("unknown mode: {}", other))),
        }
    }
}

/// How a rule wants its destination resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveStrategy {
    #[default]
    Default,
    PreferIpv4,
    PreferIpv6,
    OnlyIpv4,
    OnlyIpv6,
}

impl FromStr for ResolveStrategy {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(ResolveStrategy::Default),
            "prefer_ipv4" => Ok(ResolveStrategy::PreferIpv4),
            "prefer_ipv6" => Ok(ResolveStrategy::PreferIpv6),
            "only_ipv4" => Ok(ResolveStrategy::OnlyIpv4),
            "only_ipv6" => Ok(ResolveStrategy::OnlyIpv6),
            other => Err(RouteError::InvalidRule(format!(
                "unknown resolve strategy: {}",
                other
            ))),
        }
    }
}

/// Whether a proxied UDP destination that is still a hostname gets
/// resolved before dialing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UdpFqdnStrategy {
    #[default]
    Default,
    Resolve,
    SkipResolve,
}

/// Address-family preference handed to the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResolverPreference {
    #[default]
    Default,
    PreferIpv4,
    PreferIpv6,
}

/// The outcome attached to a rule: mode, optional outbound tag and
/// resolution hints.
///
/// Rule sets intern these, so equal decisions share one allocation;
/// equality is always by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ModeDecision {
    pub mode: Mode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default)]
    pub resolve_strategy: ResolveStrategy,
    #[serde(default)]
    pub udp_fqdn_strategy: UdpFqdnStrategy,
    /// Resolver name overriding the per-mode fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver: Option<String>,
}

impl ModeDecision {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        self.tag = if tag.is_empty() { None } else { Some(tag) };
        self
    }

    pub fn with_resolve_strategy(mut self, strategy: ResolveStrategy) -> Self {
        self.resolve_strategy = strategy;
        self
    }

    pub fn with_udp_fqdn_strategy(mut self, strategy: UdpFqdnStrategy) -> Self {
        self.udp_fqdn_strategy = strategy;
        self
    }

    pub fn with_resolver(mut self, resolver: impl Into<String>) -> Self {
        let resolver = resolver.into();
        self.resolver = if resolver.is_empty() {
            None
        } else {
            Some(resolver)
        };
        self
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }
}

impl From<Mode> for ModeDecision {
    fn from(mode: Mode) -> Self {
        Self::new(mode)
    }
}

/// Destination host: a name or a literal IP.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    Domain(String),
    Ip(IpAddr),
}

impl Host {
    /// Parse a host string, classifying IP literals (bracketed v6 included).
    pub fn parse(host: &str) -> Self {
        let trimmed = host.trim();
        let bare = trimmed
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(trimmed);
        match bare.parse::<IpAddr>() {
            Ok(ip) => Host::Ip(ip),
            Err(_) => Host::Domain(trimmed.to_string()),
        }
    }

    pub fn is_domain(&self) -> bool {
        matches!(self, Host::Domain(_))
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Domain(d) => f.write_str(d),
            Host::Ip(ip) => write!(f, "{}", ip),
        }
    }
}

/// Destination address of a connection: host plus port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: Host,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl AsRef<str>, port: u16) -> Self {
        Self {
            host: Host::parse(host.as_ref()),
            port,
        }
    }

    pub fn domain(name: impl Into<String>, port: u16) -> Self {
        Self {
            host: Host::Domain(name.into()),
            port,
        }
    }

    pub fn ip(ip: IpAddr, port: u16) -> Self {
        Self {
            host: Host::Ip(ip),
            port,
        }
    }

    pub fn is_fqdn(&self) -> bool {
        self.host.is_domain()
    }

    /// Host part as a string (no port).
    pub fn hostname(&self) -> String {
        self.host.to_string()
    }

    /// Socket address if the host is already an IP.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.host {
            Host::Ip(ip) => Some(SocketAddr::new(ip, self.port)),
            Host::Domain(_) => None,
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::ip(addr.ip(), addr.port())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host {
            Host::Ip(IpAddr::V6(v6)) => write!(f, "[{}]:{}", v6, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

impl FromStr for Address {
    type Err = RouteError;

    /// Parse `host:port`, `[v6]:port` or `ip:port`.
    fn from_str(s: &str) -> Result<Self> {
        if let Ok(sock) = s.parse::<SocketAddr>() {
            return Ok(sock.into());
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| RouteError::InvalidAddress(s.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| RouteError::InvalidAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(RouteError::InvalidAddress(s.to_string()));
        }
        Ok(Self::new(host, port))
    }
}

/// What a rule pattern is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PatternKind {
    /// Hostname, IP or CIDR.
    #[default]
    Host,
    /// Reference to a file with one pattern per line.
    File,
    /// Executable path of the owning process.
    Process,
}

impl PatternKind {
    /// Split an optional `file:` / `process:` prefix off a pattern.
    pub fn split(pattern: &str) -> (PatternKind, &str) {
        match pattern.split_once(':') {
            Some(("file", rest)) => (PatternKind::File, rest),
            Some(("process", rest)) => (PatternKind::Process, rest),
            _ => (PatternKind::Host, pattern),
        }
    }
}

/// One parsed rule line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRule {
    pub kind: PatternKind,
    pub pattern: String,
    pub decision: ModeDecision,
    /// 1-based line number, 0 when not read from text.
    pub line_num: usize,
}

impl TextRule {
    pub fn new(pattern: impl AsRef<str>, decision: ModeDecision) -> Self {
        let (kind, pattern) = PatternKind::split(pattern.as_ref());
        Self {
            kind,
            pattern: pattern.to_string(),
            decision,
            line_num: 0,
        }
    }
}
