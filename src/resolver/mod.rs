//! DNS resolver module.
//!
//! Defines the resolver interface the dispatcher consumes, a name-keyed
//! registry, and a few simple implementations.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;

use crate::error::{Result, RouteError};
use crate::types::ResolverPreference;

/// Options for a single lookup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupOptions {
    /// Address family ordering of the returned list.
    pub preference: ResolverPreference,
}

impl LookupOptions {
    pub fn new(preference: ResolverPreference) -> Self {
        Self { preference }
    }
}

/// DNS resolver interface.
pub trait Resolver: Send + Sync {
    /// Resolve the hostname to its candidate addresses, in preference order.
    ///
    /// An empty list is a valid answer; errors mean the lookup failed.
    fn lookup_ip(&self, host: &str, opts: &LookupOptions) -> Result<Vec<IpAddr>>;
}

/// System DNS resolver using the OS resolver.
pub struct SystemResolver;

impl SystemResolver {
    /// Create a new system resolver.
    pub fn new() -> Self {
        Self
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver for SystemResolver {
    fn lookup_ip(&self, host: &str, opts: &LookupOptions) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let addrs = (host, 0u16)
            .to_socket_addrs()
            .map_err(|e| RouteError::ResolveError(format!("Failed to resolve {}: {}", host, e)))?;

        let mut ips: Vec<IpAddr> = Vec::new();
        for addr in addrs {
            if !ips.contains(&addr.ip()) {
                ips.push(addr.ip());
            }
        }
        order_by_preference(&mut ips, opts.preference);
        Ok(ips)
    }
}

/// Nil resolver that always returns no addresses.
pub struct NilResolver;

impl NilResolver {
    /// Create a new nil resolver.
    pub fn new() -> Self {
        Self
    }
}

impl Default for NilResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver for NilResolver {
    fn lookup_ip(&self, _host: &str, _opts: &LookupOptions) -> Result<Vec<IpAddr>> {
        Ok(Vec::new())
    }
}

/// Static resolver with predefined mappings.
pub struct StaticResolver {
    mappings: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    /// Create a new empty static resolver.
    pub fn new() -> Self {
        Self {
            mappings: HashMap::new(),
        }
    }

    /// Add a mapping for a hostname.
    pub fn add(&mut self, host: impl Into<String>, ips: Vec<IpAddr>) {
        self.mappings.insert(host.into().to_lowercase(), ips);
    }

    /// Add a mapping and return self for chaining.
    pub fn with_mapping(mut self, host: impl Into<String>, ips: Vec<IpAddr>) -> Self {
        self.add(host, ips);
        self
    }
}

impl Default for StaticResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver for StaticResolver {
    fn lookup_ip(&self, host: &str, opts: &LookupOptions) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let mut ips = self
            .mappings
            .get(&host.to_lowercase())
            .cloned()
            .ok_or_else(|| RouteError::ResolveError(format!("Host not found: {}", host)))?;
        order_by_preference(&mut ips, opts.preference);
        Ok(ips)
    }
}

/// Resolvers keyed by name (`"proxy"`, `"direct"`, `"block"` or any
/// user-chosen name).
#[derive(Clone, Default)]
pub struct ResolverRegistry {
    resolvers: HashMap<String, Arc<dyn Resolver>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a resolver.
    pub fn register(&mut self, name: impl Into<String>, resolver: Arc<dyn Resolver>) {
        self.resolvers.insert(name.into(), resolver);
    }

    /// Register a resolver and return self for chaining.
    pub fn with_resolver(mut self, name: impl Into<String>, resolver: Arc<dyn Resolver>) -> Self {
        self.register(name, resolver);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Resolver>> {
        self.resolvers.get(name)
    }

    /// Pick `preferred` if registered, otherwise `fallback`. Returns the
    /// chosen name.
    pub fn select<'a>(&self, preferred: Option<&'a str>, fallback: &'a str) -> Option<&'a str> {
        preferred
            .filter(|name| self.resolvers.contains_key(*name))
            .or_else(|| Some(fallback).filter(|name| self.resolvers.contains_key(*name)))
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

impl fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.resolvers.keys().collect();
        names.sort();
        f.debug_struct("ResolverRegistry")
            .field("resolvers", &names)
            .finish()
    }
}

/// Stable reorder putting the preferred family first.
pub(crate) fn order_by_preference(ips: &mut [IpAddr], preference: ResolverPreference) {
    match preference {
        ResolverPreference::Default => {}
        ResolverPreference::PreferIpv4 => ips.sort_by_key(|ip| !ip.is_ipv4()),
        ResolverPreference::PreferIpv6 => ips.sort_by_key(|ip| !ip.is_ipv6()),
    }
}
