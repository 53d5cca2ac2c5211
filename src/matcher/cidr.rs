use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;

use crate::error::{Result, RouteError};

#[derive(Debug, Clone)]
struct PrefixNode<T> {
    mark: Option<(T, u8)>,
    zero: Option<Box<PrefixNode<T>>>,
    one: Option<Box<PrefixNode<T>>>,
}

impl<T> Default for PrefixNode<T> {
    fn default() -> Self {
        Self {
            mark: None,
            zero: None,
            one: None,
        }
    }
}

impl<T> PrefixNode<T> {
    fn child(&self, bit: bool) -> Option<&PrefixNode<T>> {
        if bit {
            self.one.as_deref()
        } else {
            self.zero.as_deref()
        }
    }

    fn child_slot(&mut self, bit: bool) -> &mut Option<Box<PrefixNode<T>>> {
        if bit {
            &mut self.one
        } else {
            &mut self.zero
        }
    }

    fn is_empty(&self) -> bool {
        self.mark.is_none() && self.zero.is_none() && self.one.is_none()
    }
}

/// Binary trie over the leading bits of a fixed-width key, answering
/// longest-prefix-match queries.
#[derive(Debug, Clone)]
pub struct PrefixTrie<T> {
    root: PrefixNode<T>,
    width: u8,
}

impl<T> PrefixTrie<T> {
    /// Trie over `width`-bit keys (32 for IPv4, 128 for IPv6).
    pub fn new(width: u8) -> Self {
        Self {
            root: PrefixNode::default(),
            width: width.min(128),
        }
    }

    fn bit(&self, key: u128, index: u8) -> bool {
        (key >> (self.width - 1 - index)) & 1 == 1
    }

    /// Mark the node `prefix_len` bits deep. Anything previously inserted
    /// below that node is discarded.
    pub fn insert(&mut self, key: u128, prefix_len: u8, value: T) -> Option<T> {
        let prefix_len = prefix_len.min(self.width);
        let bits: Vec<bool> = (0..prefix_len).map(|i| self.bit(key, i)).collect();

        let mut node = &mut self.root;
        for bit in bits {
            node = &mut **node.child_slot(bit).get_or_insert_with(Box::default);
        }
        node.zero = None;
        node.one = None;
        node.mark.replace((value, prefix_len)).map(|(old, _)| old)
    }

    /// Deepest mark along the key's path.
    pub fn search(&self, key: u128) -> Option<&T> {
        self.search_prefix(key).map(|(value, _)| value)
    }

    /// Deepest mark along the key's path, with its prefix length.
    pub fn search_prefix(&self, key: u128) -> Option<(&T, u8)> {
        let mut node = &self.root;
        let mut best = node.mark.as_ref();
        for i in 0..self.width {
            match node.child(self.bit(key, i)) {
                Some(child) => {
                    node = child;
                    if child.mark.is_some() {
                        best = child.mark.as_ref();
                    }
                }
                None => break,
            }
        }
        best.map(|(value, len)| (value, *len))
    }

    /// Clear the mark at `prefix_len` and prune branches left empty.
    pub fn remove(&mut self, key: u128, prefix_len: u8) -> Option<T> {
        let prefix_len = prefix_len.min(self.width);
        let bits: Vec<bool> = (0..prefix_len).map(|i| self.bit(key, i)).collect();

        let removed = {
            let target = Self::descend_mut(&mut self.root, &bits)?;
            target.mark.take().map(|(value, _)| value)
        };

        for depth in (0..bits.len()).rev() {
            let Some(parent) = Self::descend_mut(&mut self.root, &bits[..depth]) else {
                break;
            };
            let slot = parent.child_slot(bits[depth]);
            if !slot.as_deref().is_some_and(PrefixNode::is_empty) {
                break;
            }
            *slot = None;
        }

        removed
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    fn descend_mut<'a>(
        mut node: &'a mut PrefixNode<T>,
        bits: &[bool],
    ) -> Option<&'a mut PrefixNode<T>> {
        for bit in bits {
            node = node.child_slot(*bit).as_deref_mut()?;
        }
        Some(node)
    }
}

/// One prefix trie per address family.
///
/// IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) are folded into the IPv4
/// trie on both insert and search.
#[derive(Debug, Clone)]
pub struct CidrTrie<T> {
    v4: PrefixTrie<T>,
    v6: PrefixTrie<T>,
}

impl<T> Default for CidrTrie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CidrTrie<T> {
    pub fn new() -> Self {
        Self {
            v4: PrefixTrie::new(32),
            v6: PrefixTrie::new(128),
        }
    }

    /// Insert a `ip/len` or bare IP literal.
    pub fn insert(&mut self, literal: &str, value: T) -> Result<Option<T>> {
        let net = parse_net(literal)?;
        Ok(self.insert_net(net, value))
    }

    pub fn insert_net(&mut self, net: IpNet, value: T) -> Option<T> {
        match normalize_net(net) {
            (IpAddr::V4(v4), len) => self.v4.insert(v4_key(v4), len, value),
            (IpAddr::V6(v6), len) => self.v6.insert(v6_key(v6), len, value),
        }
    }

    pub fn insert_ip(&mut self, ip: IpAddr, value: T) -> Option<T> {
        match host_net(ip) {
            Ok(net) => self.insert_net(net, value),
            Err(_) => None,
        }
    }

    pub fn search(&self, ip: IpAddr) -> Option<&T> {
        match normalize_ip(ip) {
            IpAddr::V4(v4) => self.v4.search(v4_key(v4)),
            IpAddr::V6(v6) => self.v6.search(v6_key(v6)),
        }
    }

    pub fn remove(&mut self, literal: &str) -> Result<Option<T>> {
        let net = parse_net(literal)?;
        Ok(self.remove_net(net))
    }

    pub fn remove_net(&mut self, net: IpNet) -> Option<T> {
        match normalize_net(net) {
            (IpAddr::V4(v4), len) => self.v4.remove(v4_key(v4), len),
            (IpAddr::V6(v6), len) => self.v6.remove(v6_key(v6), len),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }
}

/// Parse `ip/len` or a bare IP (full-length prefix).
pub(crate) fn parse_net(literal: &str) -> Result<IpNet> {
    let literal = literal.trim();
    if let Ok(net) = literal.parse::<IpNet>() {
        return Ok(net);
    }
    let ip = literal
        .parse::<IpAddr>()
        .map_err(|_| RouteError::InvalidCidr(literal.to_string()))?;
    host_net(ip)
}

fn host_net(ip: IpAddr) -> Result<IpNet> {
    let len = if ip.is_ipv4() { 32 } else { 128 };
    IpNet::new(ip, len).map_err(|e| RouteError::InvalidCidr(format!("{}: {}", ip, e)))
}

fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        v4 => v4,
    }
}

fn normalize_net(net: IpNet) -> (IpAddr, u8) {
    match net {
        IpNet::V4(n) => (IpAddr::V4(n.addr()), n.prefix_len()),
        IpNet::V6(n) => match n.addr().to_ipv4_mapped() {
            Some(v4) if n.prefix_len() >= 96 => (IpAddr::V4(v4), n.prefix_len() - 96),
            _ => (IpAddr::V6(n.addr()), n.prefix_len()),
        },
    }
}

fn v4_key(ip: Ipv4Addr) -> u128 {
    u128::from(u32::from(ip))
}

fn v6_key(ip: Ipv6Addr) -> u128 {
    u128::from(ip)
}
