//! Reject outbound implementation.
//!
//! Rejects all connection attempts.

use std::net::{TcpStream, UdpSocket};

use crate::error::{OutboundErrorKind, Result, RouteError};
use crate::types::Address;

use super::Outbound;

/// Reject outbound that rejects all connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reject;

impl Reject {
    /// Create a new Reject outbound.
    pub fn new() -> Self {
        Self
    }
}

fn rejected(addr: &Address) -> RouteError {
    RouteError::outbound(
        OutboundErrorKind::Rejected,
        format!("Connection rejected: {}", addr),
    )
}

impl Outbound for Reject {
    fn dial_tcp(&self, addr: &Address) -> Result<TcpStream> {
        Err(rejected(addr))
    }

    fn dial_udp(&self, addr: &Address) -> Result<UdpSocket> {
        Err(rejected(addr))
    }
}
