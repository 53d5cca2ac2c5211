//! Outbound connection interfaces.
//!
//! The router turns a mode decision into a connection through an
//! [`OutboundSelector`]. How an outbound reaches its target (local sockets,
//! a proxy server, a tunnel) belongs to the implementor; only [`Reject`]
//! ships with the crate.

use std::collections::HashMap;
use std::net::{TcpStream, UdpSocket};
use std::sync::Arc;

use crate::error::{OutboundErrorKind, Result, RouteError};
use crate::types::{Address, Mode, Network};

mod reject;

pub use reject::Reject;

/// A way out for routed traffic.
pub trait Outbound: Send + Sync {
    /// Open a stream towards `addr`.
    fn dial_tcp(&self, addr: &Address) -> Result<TcpStream>;

    /// Open a datagram socket for traffic towards `addr`.
    fn dial_udp(&self, addr: &Address) -> Result<UdpSocket>;
}

/// Picks the outbound for a routed connection.
pub trait OutboundSelector: Send + Sync {
    /// Outbound for `mode` (by name), or the one registered under `tag`.
    fn get(&self, network: Network, mode: &str, tag: Option<&str>) -> Result<Arc<dyn Outbound>>;
}

/// Outbounds registered by name, with a built-in `block`.
///
/// Lookup order: the tag if one is given and registered, then the mode
/// name. `bypass` is served by the `proxy` outbound.
pub struct StaticSelector {
    outbounds: HashMap<String, Arc<dyn Outbound>>,
}

impl StaticSelector {
    /// Build from named outbounds. Names are case-insensitive.
    pub fn new(outbounds: Vec<(String, Arc<dyn Outbound>)>) -> Self {
        let mut map: HashMap<String, Arc<dyn Outbound>> = HashMap::with_capacity(outbounds.len() + 1);

        for (name, outbound) in outbounds {
            map.insert(name.to_lowercase(), outbound);
        }

        map.entry(Mode::Block.as_str().to_string())
            .or_insert_with(|| Arc::new(Reject::new()));

        Self { outbounds: map }
    }

    /// Register (or replace) a named outbound.
    pub fn with_outbound(mut self, name: impl AsRef<str>, outbound: Arc<dyn Outbound>) -> Self {
        self.outbounds.insert(name.as_ref().to_lowercase(), outbound);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.outbounds.contains_key(&name.to_lowercase())
    }
}

impl Default for StaticSelector {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl OutboundSelector for StaticSelector {
    fn get(&self, _network: Network, mode: &str, tag: Option<&str>) -> Result<Arc<dyn Outbound>> {
        if let Some(outbound) = tag.and_then(|tag| self.outbounds.get(&tag.to_lowercase())) {
            return Ok(outbound.clone());
        }

        let mode = mode.to_lowercase();
        let name = if mode == Mode::Bypass.as_str() {
            Mode::Proxy.as_str()
        } else {
            mode.as_str()
        };
        self.outbounds.get(name).cloned().ok_or_else(|| {
            RouteError::outbound(
                OutboundErrorKind::NotFound,
                format!("no outbound for mode {} (tag {:?})", name, tag),
            )
        })
    }
}
