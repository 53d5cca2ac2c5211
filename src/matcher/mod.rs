//! Pattern matchers.
//!
//! [`DomainTrie`] answers hostname (and process path) patterns, [`CidrTrie`]
//! answers IP prefixes, and [`Matcher`] puts both behind one lookup keyed by
//! a host literal.

pub mod cidr;
pub mod domain;
pub mod label;

pub use cidr::{CidrTrie, PrefixTrie};
pub use domain::DomainTrie;
pub use label::LabelReader;

use std::net::IpAddr;

use tracing::debug;

use crate::error::Result;
use crate::resolver::{LookupOptions, Resolver};
use crate::types::Host;

/// Resolver used to retry a hostname against the prefix rules.
pub type ResolverHook<'a> = (&'a dyn Resolver, &'a LookupOptions);

/// Hostname trie plus prefix trie.
#[derive(Debug, Clone)]
pub struct Matcher<T> {
    domain: DomainTrie<T>,
    cidr: CidrTrie<T>,
}

impl<T> Default for Matcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Matcher<T> {
    pub fn new() -> Self {
        Self {
            domain: DomainTrie::new(),
            cidr: CidrTrie::new(),
        }
    }

    /// Insert an IP, CIDR or hostname pattern.
    ///
    /// Anything that does not parse as an address is a hostname pattern and
    /// never an error; the `Result` only reports malformed prefix lengths
    /// such as `10.0.0.0/40`.
    pub fn insert(&mut self, literal: &str, value: T) -> Result<Option<T>> {
        let literal = literal.trim();
        if let Some(net) = ip_literal(literal) {
            return self.cidr.insert(net, value);
        }
        Ok(self.domain.insert(&normalize_hostname(literal), value))
    }

    pub fn remove(&mut self, literal: &str) -> Result<Option<T>> {
        let literal = literal.trim();
        if let Some(net) = ip_literal(literal) {
            return self.cidr.remove(net);
        }
        Ok(self.domain.remove(&normalize_hostname(literal)))
    }

    /// Look up a host.
    ///
    /// IPs go to the prefix trie. Hostnames go to the domain trie and, on a
    /// miss, are resolved through `hook` and each address tried in the
    /// resolver's order. Lookup failures count as no match.
    pub fn search(&self, host: &Host, hook: Option<ResolverHook<'_>>) -> Option<&T> {
        match host {
            Host::Ip(ip) => self.cidr.search(*ip),
            Host::Domain(name) => self.search_domain(name, hook),
        }
    }

    /// Look up a host literal, parsing it first.
    pub fn search_str(&self, host: &str, hook: Option<ResolverHook<'_>>) -> Option<&T> {
        self.search(&Host::parse(host), hook)
    }

    pub fn search_ip(&self, ip: IpAddr) -> Option<&T> {
        self.cidr.search(ip)
    }

    fn search_domain(&self, name: &str, hook: Option<ResolverHook<'_>>) -> Option<&T> {
        let lowered;
        let mut name = name.strip_suffix('.').unwrap_or(name);
        if name.as_bytes().iter().any(|b| b.is_ascii_uppercase()) {
            lowered = name.to_ascii_lowercase();
            name = &lowered;
        }

        if let Some(found) = self.domain.search(name) {
            return Some(found);
        }

        let (resolver, opts) = hook?;
        if !self.needs_ip_matching() {
            return None;
        }

        match resolver.lookup_ip(name, opts) {
            Ok(ips) => ips.into_iter().find_map(|ip| self.cidr.search(ip)),
            Err(e) => {
                debug!(host = name, error = %e, "resolve for prefix match failed");
                None
            }
        }
    }

    /// Whether any prefix rule exists, i.e. a hostname miss is worth a DNS
    /// lookup.
    pub fn needs_ip_matching(&self) -> bool {
        !self.cidr.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.domain.is_empty() && self.cidr.is_empty()
    }
}

/// The literal without brackets if it is an IP or CIDR.
fn ip_literal(literal: &str) -> Option<&str> {
    let bare = literal
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(literal);
    let addr = bare.split_once('/').map_or(bare, |(addr, _)| addr);
    addr.parse::<IpAddr>().ok().map(|_| bare)
}

fn normalize_hostname(pattern: &str) -> String {
    pattern.strip_suffix('.').unwrap_or(pattern).to_ascii_lowercase()
}
