//! Per-connection dispatch state.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::types::{Address, Mode, ModeDecision, ResolverPreference};

/// Why a dispatch ended with its mode. Observability only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchReason {
    /// Nothing matched; proxied by default.
    #[default]
    Default,
    Forced,
    NetworkDefault,
    RuleTrie,
    SniffMode,
    ProcessTrie,
}

impl MatchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchReason::Default => "default",
            MatchReason::Forced => "forced",
            MatchReason::NetworkDefault => "network default",
            MatchReason::RuleTrie => "rule trie",
            MatchReason::SniffMode => "sniff",
            MatchReason::ProcessTrie => "process trie",
        }
    }
}

impl fmt::Display for MatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable context carried through one dispatch.
///
/// Callers fill the inputs (forced mode, sniff results, socket pair); the
/// router fills the outputs.
#[derive(Debug, Clone, Default)]
pub struct MatchContext {
    /// Mode imposed by the inbound; `Bypass` means none.
    pub forced_mode: Mode,
    /// Mode suggested by protocol sniffing; `Bypass` means none.
    pub sniffed_mode: Mode,
    /// Hostname recovered by sniffing (TLS SNI, HTTP Host).
    pub sniffed_hostname: Option<String>,
    /// Owning process path. Looked up when unset and a source is known.
    pub process_name: Option<String>,
    pub inbound_tag: Option<String>,
    /// Client side of the connection.
    pub source: Option<SocketAddr>,
    /// Local address the connection arrived on.
    pub inbound: Option<SocketAddr>,
    pub cancel: Option<Arc<AtomicBool>>,

    pub resolver_preference: ResolverPreference,
    /// Forward a proxied UDP hostname without resolving it.
    pub skip_resolve: bool,
    /// Name of the resolver chosen for this connection.
    pub resolver: Option<String>,
    pub mode: Mode,
    pub reason: MatchReason,
    pub decision: Option<Arc<ModeDecision>>,
    /// Hostname before a local pre-resolve rewrote it.
    pub domain: Option<String>,
    /// Address a local pre-resolve produced.
    pub ip: Option<IpAddr>,
    pub trace: Vec<String>,
}

impl MatchContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_forced_mode(mut self, mode: Mode) -> Self {
        self.forced_mode = mode;
        self
    }

    pub fn with_sniffed_mode(mut self, mode: Mode) -> Self {
        self.sniffed_mode = mode;
        self
    }

    pub fn with_sniffed_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.sniffed_hostname = Some(hostname.into());
        self
    }

    pub fn with_process_name(mut self, path: impl Into<String>) -> Self {
        self.process_name = Some(path.into());
        self
    }

    pub fn with_inbound_tag(mut self, tag: impl Into<String>) -> Self {
        self.inbound_tag = Some(tag.into());
        self
    }

    pub fn with_source(mut self, source: SocketAddr) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_inbound(mut self, inbound: SocketAddr) -> Self {
        self.inbound = Some(inbound);
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    pub(crate) fn note(&mut self, entry: impl Into<String>) {
        self.trace.push(entry.into());
    }
}

/// Result of a dispatch: the decision plus the possibly rewritten address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub decision: Arc<ModeDecision>,
    pub address: Address,
}

impl Dispatched {
    pub fn mode(&self) -> Mode {
        self.decision.mode
    }

    pub fn tag(&self) -> Option<&str> {
        self.decision.tag()
    }
}
