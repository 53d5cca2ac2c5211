//! Router module.
//!
//! The dispatcher: turns a destination plus per-connection context into a
//! mode decision, an outbound tag and a resolver. Rule sets are immutable
//! snapshots published through [`ArcSwap`]; reloads build a new snapshot off
//! the hot path and swap it in, so lookups never wait on a rebuild.

use std::collections::BTreeSet;
use std::fs;
use std::net::{IpAddr, SocketAddr, TcpStream, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::compile::{compile, RuleSet};
use crate::config::{CustomRule, RouterConfig};
use crate::error::{OutboundErrorKind, Result, RouteError};
use crate::history::{RejectHistory, DEFAULT_REJECT_HISTORY_SIZE};
use crate::matcher::ResolverHook;
use crate::outbound::{Outbound, OutboundSelector};
use crate::parser::load_rule_file;
use crate::process::{trim_deleted, ProcessCache, ProcessDumper, DEFAULT_PROCESS_CACHE_SIZE};
use crate::resolver::{LookupOptions, Resolver, ResolverRegistry};
use crate::types::{
    Address, Host, Mode, ModeDecision, Network, ResolveStrategy, ResolverPreference, TextRule,
    UdpFqdnStrategy,
};

mod context;

pub use context::{Dispatched, MatchContext, MatchReason};

/// Router builder options.
pub struct RouterOptions {
    /// LRU cache size for process lookups
    pub process_cache_size: usize,
    /// Capacity of the reject history ring
    pub reject_history_size: usize,
    pub resolvers: ResolverRegistry,
    pub selector: Option<Arc<dyn OutboundSelector>>,
    pub process_dumper: Option<Arc<dyn ProcessDumper>>,
    /// Shared history; a fresh one of `reject_history_size` otherwise.
    pub reject_history: Option<Arc<RejectHistory>>,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            process_cache_size: DEFAULT_PROCESS_CACHE_SIZE,
            reject_history_size: DEFAULT_REJECT_HISTORY_SIZE,
            resolvers: ResolverRegistry::new(),
            selector: None,
            process_dumper: None,
            reject_history: None,
        }
    }
}

impl RouterOptions {
    /// Create new router options.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_process_cache_size(mut self, size: usize) -> Self {
        self.process_cache_size = size;
        self
    }

    pub fn with_reject_history_size(mut self, size: usize) -> Self {
        self.reject_history_size = size;
        self
    }

    pub fn with_resolvers(mut self, resolvers: ResolverRegistry) -> Self {
        self.resolvers = resolvers;
        self
    }

    pub fn with_selector(mut self, selector: Arc<dyn OutboundSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn with_process_dumper(mut self, dumper: Arc<dyn ProcessDumper>) -> Self {
        self.process_dumper = Some(dumper);
        self
    }

    pub fn with_reject_history(mut self, history: Arc<RejectHistory>) -> Self {
        self.reject_history = Some(history);
        self
    }
}

/// Undecorated decisions for forced, default and sniffed modes.
struct BareDecisions {
    bypass: Arc<ModeDecision>,
    direct: Arc<ModeDecision>,
    proxy: Arc<ModeDecision>,
    block: Arc<ModeDecision>,
}

impl BareDecisions {
    fn new() -> Self {
        Self {
            bypass: Arc::new(ModeDecision::new(Mode::Bypass)),
            direct: Arc::new(ModeDecision::new(Mode::Direct)),
            proxy: Arc::new(ModeDecision::new(Mode::Proxy)),
            block: Arc::new(ModeDecision::new(Mode::Block)),
        }
    }

    fn get(&self, mode: Mode) -> Arc<ModeDecision> {
        match mode {
            Mode::Bypass => self.bypass.clone(),
            Mode::Direct => self.direct.clone(),
            Mode::Proxy => self.proxy.clone(),
            Mode::Block => self.block.clone(),
        }
    }
}

/// What the last rule-file load saw.
#[derive(Debug, Default)]
struct ReloadState {
    rule_file: Option<PathBuf>,
    rule_file_mtime: Option<SystemTime>,
}

/// Configuration and both rule sets as of one publication. A lookup loads
/// this once and uses it for every stage.
#[derive(Clone)]
struct Snapshot {
    config: Arc<RouterConfig>,
    custom: Arc<RuleSet>,
    file: Arc<RuleSet>,
}

impl Snapshot {
    fn match_host(&self, host: &Host, hook: Option<ResolverHook<'_>>) -> Option<Arc<ModeDecision>> {
        self.custom
            .search(host, hook)
            .or_else(|| self.file.search(host, hook))
            .cloned()
    }

    fn match_process(&self, path: &str) -> Option<Arc<ModeDecision>> {
        self.custom
            .search_process(path)
            .or_else(|| self.file.search_process(path))
            .cloned()
    }
}

/// Resolver wrapper failing fast once the connection is cancelled.
struct Cancellable<'a> {
    inner: &'a dyn Resolver,
    cancel: Option<&'a AtomicBool>,
}

impl Cancellable<'_> {
    fn check(&self, host: &str) -> Result<()> {
        match self.cancel {
            Some(flag) if flag.load(Ordering::Acquire) => Err(RouteError::ResolveError(format!(
                "lookup for {} cancelled",
                host
            ))),
            _ => Ok(()),
        }
    }
}

impl Resolver for Cancellable<'_> {
    fn lookup_ip(&self, host: &str, opts: &LookupOptions) -> Result<Vec<IpAddr>> {
        self.check(host)?;
        let ips = self.inner.lookup_ip(host, opts)?;
        self.check(host)?;
        Ok(ips)
    }
}

/// Route dispatcher.
///
/// Holds two rule sets: the custom one built from
/// [`RouterConfig::custom_rules`], consulted first, and the one loaded from
/// [`RouterConfig::rule_file`]. Both are published together with the
/// configuration, so a lookup never mixes versions.
pub struct Router {
    snapshot: ArcSwap<Snapshot>,
    writer: Mutex<ReloadState>,
    resolvers: ResolverRegistry,
    selector: Option<Arc<dyn OutboundSelector>>,
    processes: Option<ProcessCache>,
    history: Arc<RejectHistory>,
    bare: BareDecisions,
}

impl Router {
    /// Create a new router, loading both rule sources.
    ///
    /// Never fails: bad rules are skipped and an unreadable rule file is
    /// replaced by the built-in LAN rules.
    pub fn new(config: RouterConfig, options: RouterOptions) -> Self {
        let custom = compile_custom(&config.custom_rules);
        let (file, rule_file_mtime) = load_file_rules(config.rule_file.as_deref());
        info!(
            custom_rules = custom.rule_count(),
            file_rules = file.rule_count(),
            "router rules loaded"
        );

        let history = options
            .reject_history
            .unwrap_or_else(|| Arc::new(RejectHistory::new(options.reject_history_size)));
        let processes = options
            .process_dumper
            .map(|dumper| ProcessCache::new(dumper, options.process_cache_size));

        Self {
            writer: Mutex::new(ReloadState {
                rule_file: config.rule_file.clone(),
                rule_file_mtime,
            }),
            snapshot: ArcSwap::from_pointee(Snapshot {
                config: Arc::new(config),
                custom: Arc::new(custom),
                file: Arc::new(file),
            }),
            resolvers: options.resolvers,
            selector: options.selector,
            processes,
            history,
            bare: BareDecisions::new(),
        }
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<RouterConfig> {
        self.snapshot.load().config.clone()
    }

    pub fn custom_rule_set(&self) -> Arc<RuleSet> {
        self.snapshot.load().custom.clone()
    }

    pub fn file_rule_set(&self) -> Arc<RuleSet> {
        self.snapshot.load().file.clone()
    }

    pub fn reject_history(&self) -> &Arc<RejectHistory> {
        &self.history
    }

    pub fn resolvers(&self) -> &ResolverRegistry {
        &self.resolvers
    }

    /// Tags referenced by either rule set.
    pub fn tags(&self) -> BTreeSet<String> {
        let snapshot = self.snapshot.load();
        snapshot
            .custom
            .tags()
            .union(snapshot.file.tags())
            .cloned()
            .collect()
    }

    /// Replace the custom rules. Skipped when they are unchanged, unless
    /// `force` is set. Returns whether a rebuild happened.
    pub fn update_custom_rules(&self, rules: Vec<CustomRule>, force: bool) -> bool {
        let _writer = self.writer.lock();
        let current = self.snapshot.load_full();
        if !force && current.config.custom_rules == rules {
            debug!("custom rules unchanged");
            return false;
        }

        let custom = build_custom(&rules);
        let mut config = RouterConfig::clone(&current.config);
        config.custom_rules = rules;
        self.snapshot.store(Arc::new(Snapshot {
            config: Arc::new(config),
            custom,
            file: current.file.clone(),
        }));
        true
    }

    /// Re-read the rule file. Skipped when its modification time is
    /// unchanged, unless `force` is set. Returns whether a rebuild happened.
    pub fn reload_rule_file(&self, force: bool) -> bool {
        let mut state = self.writer.lock();
        let current = self.snapshot.load_full();
        match reload_file_locked(&mut state, current.config.rule_file.as_deref(), force) {
            Some(file) => {
                self.snapshot.store(Arc::new(Snapshot {
                    file,
                    ..Snapshot::clone(&current)
                }));
                true
            }
            None => false,
        }
    }

    /// Apply a new configuration, rebuilding only the rule sets whose
    /// source changed (or both with `force`). Returns whether anything
    /// changed.
    pub fn apply(&self, config: RouterConfig, force: bool) -> bool {
        let mut state = self.writer.lock();
        let current = self.snapshot.load_full();

        let mut changed = *current.config != config;
        let custom = if force || current.config.custom_rules != config.custom_rules {
            changed = true;
            build_custom(&config.custom_rules)
        } else {
            current.custom.clone()
        };
        let file = match reload_file_locked(&mut state, config.rule_file.as_deref(), force) {
            Some(file) => {
                changed = true;
                file
            }
            None => current.file.clone(),
        };

        self.snapshot.store(Arc::new(Snapshot {
            config: Arc::new(config),
            custom,
            file,
        }));
        changed
    }

    /// Decision for a host: custom rules first, then file rules, `proxy`
    /// when neither matches. Hostnames are not resolved.
    pub fn search(&self, host: &Host) -> Arc<ModeDecision> {
        self.snapshot
            .load()
            .match_host(host, None)
            .unwrap_or_else(|| self.bare.get(Mode::Proxy))
    }

    /// Resolver for a DNS query about `domain`, chosen by the rule that
    /// matches it. Blocked queries are recorded in the reject history.
    pub fn resolver_for(&self, domain: &str, process: Option<&str>) -> Option<Arc<dyn Resolver>> {
        let snapshot = self.snapshot.load_full();
        let decision = snapshot
            .match_host(&Host::parse(domain), None)
            .unwrap_or_else(|| self.bare.get(Mode::Proxy));
        let mode = match decision.mode {
            Mode::Bypass => Mode::Proxy,
            mode => mode,
        };
        if mode == Mode::Block {
            debug!(domain, "dns query blocked");
            self.history.push("dns", domain, process.map(str::to_string));
        }

        let name = self
            .resolvers
            .select(decision.resolver.as_deref(), snapshot.config.fallback_resolver(mode))?;
        self.resolvers.get(name).cloned()
    }

    /// Decide where a connection goes.
    ///
    /// Stages, in order:
    /// 1. owning process lookup (context only)
    /// 2. forced mode, else the network default
    /// 3. rule tries, only while the mode is still `bypass`
    /// 4. sniffed mode, else process rules, unless the mode is `block`
    /// 5. resolver selection, reject history and optional local resolve
    ///
    /// Never fails; lookup errors degrade to "no match".
    pub fn dispatch(&self, network: Network, address: Address, ctx: &mut MatchContext) -> Dispatched {
        let snapshot = self.snapshot.load_full();
        let config = &snapshot.config;

        self.resolve_process(network, &address, ctx);

        let mut decision = if !ctx.forced_mode.is_bypass() {
            ctx.reason = MatchReason::Forced;
            self.bare.get(ctx.forced_mode)
        } else {
            ctx.reason = MatchReason::NetworkDefault;
            self.bare.get(config.network_mode(network))
        };
        ctx.note(format!("{}: {} {}", ctx.reason, network, decision.mode));

        if decision.mode.is_bypass() {
            decision = self.match_rules(&snapshot, &address, ctx);
        }

        if decision.mode != Mode::Block {
            if !ctx.sniffed_mode.is_bypass() {
                decision = self.bare.get(ctx.sniffed_mode);
                ctx.reason = MatchReason::SniffMode;
                ctx.note(format!("{}: {}", ctx.reason, decision.mode));
            } else if let Some(hit) = ctx
                .process_name
                .as_deref()
                .and_then(|path| snapshot.match_process(path))
                .filter(|hit| !hit.mode.is_bypass())
            {
                decision = hit;
                ctx.reason = MatchReason::ProcessTrie;
                ctx.note(format!("{}: {}", ctx.reason, describe(&decision)));
            }
        }

        self.finalize(config, network, address, decision, ctx)
    }

    fn resolve_process(&self, network: Network, address: &Address, ctx: &mut MatchContext) {
        if ctx.process_name.is_none() {
            if let (Some(cache), Some(source)) = (&self.processes, ctx.source) {
                let candidates: Vec<SocketAddr> =
                    ctx.inbound.into_iter().chain(address.socket_addr()).collect();
                ctx.process_name = cache
                    .lookup(network, source, &candidates)
                    .map(|process| process.path);
            }
        }

        let entry = ctx.process_name.as_mut().map(|name| {
            let len = trim_deleted(name).len();
            name.truncate(len);
            format!("process: {}", name)
        });
        if let Some(entry) = entry {
            ctx.note(entry);
        }
    }

    fn match_rules(
        &self,
        snapshot: &Snapshot,
        address: &Address,
        ctx: &mut MatchContext,
    ) -> Arc<ModeDecision> {
        let config = &snapshot.config;
        let host = match ctx.sniffed_hostname.as_deref() {
            Some(sniffed) if !address.is_fqdn() && !sniffed.is_empty() => Host::parse(sniffed),
            _ => address.host.clone(),
        };

        let opts = LookupOptions::new(resolver_preference(ResolveStrategy::Default, config.ipv6));
        let cancel = ctx.cancel.clone();
        let matched = match self.resolvers.get(&config.proxy_resolver) {
            Some(resolver) => {
                let resolver = Cancellable {
                    inner: resolver.as_ref(),
                    cancel: cancel.as_deref(),
                };
                let hook: ResolverHook<'_> = (&resolver, &opts);
                snapshot.match_host(&host, Some(hook))
            }
            None => snapshot.match_host(&host, None),
        };

        let decision = match matched {
            Some(decision) => {
                ctx.reason = MatchReason::RuleTrie;
                decision
            }
            None => {
                ctx.reason = MatchReason::Default;
                self.bare.get(Mode::Proxy)
            }
        };
        ctx.resolver_preference = resolver_preference(decision.resolve_strategy, config.ipv6);
        ctx.note(format!("{}: {} -> {}", ctx.reason, host, describe(&decision)));
        decision
    }

    fn finalize(
        &self,
        config: &RouterConfig,
        network: Network,
        mut address: Address,
        decision: Arc<ModeDecision>,
        ctx: &mut MatchContext,
    ) -> Dispatched {
        let decision = if decision.mode.is_bypass() {
            Arc::new(ModeDecision {
                mode: Mode::Proxy,
                ..ModeDecision::clone(&decision)
            })
        } else {
            decision
        };
        let mode = decision.mode;

        ctx.mode = mode;
        ctx.skip_resolve =
            mode == Mode::Proxy && skip_resolve(config.udp_proxy_fqdn, decision.udp_fqdn_strategy);
        ctx.resolver = self
            .resolvers
            .select(decision.resolver.as_deref(), config.fallback_resolver(mode))
            .map(str::to_string);

        if mode == Mode::Block {
            debug!(network = network.as_str(), %address, reason = %ctx.reason, "connection blocked");
            self.history
                .push(network.as_str(), address.to_string(), ctx.process_name.clone());
        }

        if config.resolve_locally && mode == Mode::Proxy && address.is_fqdn() {
            address = self.resolve_locally(address, ctx);
        }

        ctx.note(format!(
            "final: {} via {} resolver {}",
            describe(&decision),
            address,
            ctx.resolver.as_deref().unwrap_or("none")
        ));
        ctx.decision = Some(decision.clone());
        Dispatched { decision, address }
    }

    /// Pre-resolve a proxied hostname. Failures keep the hostname.
    fn resolve_locally(&self, address: Address, ctx: &mut MatchContext) -> Address {
        let hostname = address.hostname();
        let Some(selected) = ctx
            .resolver
            .as_deref()
            .and_then(|name| self.resolvers.get(name))
            .cloned()
        else {
            warn!(host = %hostname, "no resolver for local resolve, keeping hostname");
            return address;
        };

        let cancel = ctx.cancel.clone();
        let resolver = Cancellable {
            inner: selected.as_ref(),
            cancel: cancel.as_deref(),
        };
        let opts = LookupOptions::new(ctx.resolver_preference);
        match resolver.lookup_ip(&hostname, &opts) {
            Ok(ips) => match ips.first() {
                Some(&ip) => {
                    ctx.note(format!("resolved locally: {} -> {}", hostname, ip));
                    ctx.domain = Some(hostname);
                    ctx.ip = Some(ip);
                    Address::ip(ip, address.port)
                }
                None => {
                    warn!(host = %hostname, "local resolve returned no address, keeping hostname");
                    address
                }
            },
            Err(e) => {
                warn!(host = %hostname, error = %e, "local resolve failed, keeping hostname");
                address
            }
        }
    }

    fn outbound(&self, network: Network, dispatched: &Dispatched) -> Result<Arc<dyn Outbound>> {
        let selector = self.selector.as_ref().ok_or_else(|| {
            RouteError::outbound(OutboundErrorKind::NotFound, "no outbound selector configured")
        })?;
        selector.get(network, dispatched.mode().as_str(), dispatched.tag())
    }

    /// Dispatch a TCP connection and dial it through the selected outbound.
    pub fn dial_tcp(&self, address: Address, ctx: &mut MatchContext) -> Result<TcpStream> {
        let dispatched = self.dispatch(Network::Tcp, address, ctx);
        self.outbound(Network::Tcp, &dispatched)?
            .dial_tcp(&dispatched.address)
    }

    /// Dispatch a UDP session and open it through the selected outbound.
    pub fn dial_udp(&self, address: Address, ctx: &mut MatchContext) -> Result<UdpSocket> {
        let dispatched = self.dispatch(Network::Udp, address, ctx);
        self.outbound(Network::Udp, &dispatched)?
            .dial_udp(&dispatched.address)
    }

    /// [`Router::dispatch`] on tokio's blocking pool, for callers that must
    /// not block on resolver lookups.
    #[cfg(feature = "async")]
    pub async fn dispatch_async(
        self: &Arc<Self>,
        network: Network,
        address: Address,
        mut ctx: MatchContext,
    ) -> Result<(Dispatched, MatchContext)> {
        let router = Arc::clone(self);
        let result = tokio::task::spawn_blocking(move || {
            let dispatched = router.dispatch(network, address, &mut ctx);
            (dispatched, ctx)
        })
        .await?;
        Ok(result)
    }
}

impl Resolver for Router {
    /// Resolve through the resolver the rules pick for `host`.
    fn lookup_ip(&self, host: &str, opts: &LookupOptions) -> Result<Vec<IpAddr>> {
        match self.resolver_for(host, None) {
            Some(resolver) => resolver.lookup_ip(host, opts),
            None => Err(RouteError::ResolveError(format!("no resolver for {}", host))),
        }
    }
}

fn compile_custom(rules: &[CustomRule]) -> RuleSet {
    let rules: Vec<TextRule> = rules.iter().flat_map(CustomRule::to_text_rules).collect();
    compile(&rules)
}

fn build_custom(rules: &[CustomRule]) -> Arc<RuleSet> {
    let set = compile_custom(rules);
    info!(
        rules = set.rule_count(),
        tags = set.tags().len(),
        "custom rules reloaded"
    );
    Arc::new(set)
}

/// A fresh file rule set, or `None` when the path and modification time
/// are unchanged and `force` is not set.
fn reload_file_locked(state: &mut ReloadState, path: Option<&Path>, force: bool) -> Option<Arc<RuleSet>> {
    let mtime = path.and_then(file_mtime);
    if !force && state.rule_file.as_deref() == path && state.rule_file_mtime == mtime {
        debug!(path = ?path, "rule file unchanged");
        return None;
    }

    let (set, mtime) = load_file_rules(path);
    info!(
        path = ?path,
        rules = set.rule_count(),
        tags = set.tags().len(),
        "rule file reloaded"
    );
    state.rule_file = path.map(Path::to_path_buf);
    state.rule_file_mtime = mtime;
    Some(Arc::new(set))
}

fn load_file_rules(path: Option<&Path>) -> (RuleSet, Option<SystemTime>) {
    match path {
        Some(path) => {
            let mtime = file_mtime(path);
            (compile(&load_rule_file(path)), mtime)
        }
        None => (RuleSet::empty(), None),
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

/// Lookup preference for a rule's strategy. Without an explicit strategy,
/// IPv4 is preferred unless IPv6 is enabled.
fn resolver_preference(strategy: ResolveStrategy, ipv6: bool) -> ResolverPreference {
    match strategy {
        ResolveStrategy::PreferIpv4 | ResolveStrategy::OnlyIpv4 => ResolverPreference::PreferIpv4,
        ResolveStrategy::PreferIpv6 | ResolveStrategy::OnlyIpv6 => ResolverPreference::PreferIpv6,
        ResolveStrategy::Default if ipv6 => ResolverPreference::Default,
        ResolveStrategy::Default => ResolverPreference::PreferIpv4,
    }
}

/// A global `skip_resolve` holds unless the rule asks to resolve;
/// otherwise only a rule asking to skip does.
fn skip_resolve(global: UdpFqdnStrategy, rule: UdpFqdnStrategy) -> bool {
    if global == UdpFqdnStrategy::SkipResolve {
        rule != UdpFqdnStrategy::Resolve
    } else {
        rule == UdpFqdnStrategy::SkipResolve
    }
}

fn describe(decision: &ModeDecision) -> String {
    match decision.tag() {
        Some(tag) => format!("{} (tag={})", decision.mode, tag),
        None => decision.mode.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::StaticSelector;
    use crate::process::Process;
    use crate::resolver::StaticResolver;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;

    struct CountingResolver {
        calls: AtomicUsize,
        inner: StaticResolver,
    }

    impl Resolver for CountingResolver {
        fn lookup_ip(&self, host: &str, opts: &LookupOptions) -> Result<Vec<IpAddr>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.lookup_ip(host, opts)
        }
    }

    struct FixedDumper(&'static str);

    impl ProcessDumper for FixedDumper {
        fn process_name(&self, _: Network, _: SocketAddr, _: SocketAddr) -> Result<Process> {
            Ok(Process::new(self.0))
        }
    }

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    fn router_with(rules: Vec<CustomRule>) -> Router {
        let mut config = RouterConfig::new();
        config.custom_rules = rules;
        Router::new(config, RouterOptions::new())
    }

    fn dispatch(router: &Router, host: &str, ctx: &mut MatchContext) -> Dispatched {
        router.dispatch(Network::Tcp, Address::new(host, 443), ctx)
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("route_engine_router_{}_{}", name, std::process::id()))
    }

    #[test]
    fn test_forced_mode_beats_block_rule() {
        let router = router_with(vec![CustomRule::new(Mode::Block, ["ads.example"])]);

        let mut ctx = MatchContext::new().with_forced_mode(Mode::Proxy);
        let out = dispatch(&router, "ads.example", &mut ctx);
        assert_eq!(out.mode(), Mode::Proxy);
        assert_eq!(ctx.reason, MatchReason::Forced);

        let mut ctx = MatchContext::new();
        assert_eq!(dispatch(&router, "ads.example", &mut ctx).mode(), Mode::Block);
        assert_eq!(ctx.reason, MatchReason::RuleTrie);
    }

    #[test]
    fn test_sniff_overrides_rule_but_not_block() {
        let router = router_with(vec![
            CustomRule::new(Mode::Block, ["ads.example"]),
            CustomRule::new(Mode::Proxy, ["video.example"]).with_tag("us"),
        ]);

        let mut ctx = MatchContext::new().with_sniffed_mode(Mode::Proxy);
        assert_eq!(dispatch(&router, "ads.example", &mut ctx).mode(), Mode::Block);

        let mut ctx = MatchContext::new().with_sniffed_mode(Mode::Direct);
        let out = dispatch(&router, "video.example", &mut ctx);
        assert_eq!(out.mode(), Mode::Direct);
        assert_eq!(out.tag(), None);
        assert_eq!(ctx.reason, MatchReason::SniffMode);
    }

    #[test]
    fn test_network_default_and_fallback_proxy() {
        let config = RouterConfig::new()
            .with_network_modes(Mode::Direct, Mode::Bypass)
            .with_custom_rule(CustomRule::new(Mode::Block, ["ads.example"]));
        let router = Router::new(config, RouterOptions::new());

        let mut ctx = MatchContext::new();
        let out = router.dispatch(Network::Tcp, Address::domain("ads.example", 80), &mut ctx);
        assert_eq!(out.mode(), Mode::Direct);
        assert_eq!(ctx.reason, MatchReason::NetworkDefault);

        let mut ctx = MatchContext::new();
        let out = router.dispatch(Network::Udp, Address::domain("ads.example", 80), &mut ctx);
        assert_eq!(out.mode(), Mode::Block);

        let mut ctx = MatchContext::new();
        let out = router.dispatch(Network::Udp, Address::domain("example.org", 80), &mut ctx);
        assert_eq!(out.mode(), Mode::Proxy);
        assert_eq!(ctx.reason, MatchReason::Default);
        assert!(!ctx.trace.is_empty());
    }

    #[test]
    fn test_custom_rules_before_file_rules() {
        let path = temp_path("precedence");
        fs::write(&path, "example.com direct,tag=file\n").unwrap();

        let config = RouterConfig::new()
            .with_rule_file(&path)
            .with_custom_rule(CustomRule::new(Mode::Block, ["example.com"]));
        let router = Router::new(config, RouterOptions::new());

        assert_eq!(router.search(&Host::parse("example.com")).mode, Mode::Block);
        assert_eq!(router.file_rule_set().rule_count(), 1);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_sniffed_hostname_used_for_ip_destination() {
        let router = router_with(vec![CustomRule::new(Mode::Direct, ["*.google.com"]).with_tag("g")]);

        let mut ctx = MatchContext::new().with_sniffed_hostname("www.google.com");
        let out = router.dispatch(Network::Tcp, Address::ip(v4(142, 250, 1, 1), 443), &mut ctx);
        assert_eq!(out.tag(), Some("g"));
        assert_eq!(out.address, Address::ip(v4(142, 250, 1, 1), 443));

        // a hostname destination keeps its own name
        let mut ctx = MatchContext::new().with_sniffed_hostname("www.google.com");
        assert_eq!(dispatch(&router, "example.org", &mut ctx).mode(), Mode::Proxy);
    }

    #[test]
    fn test_cidr_rule_through_resolver() {
        let resolver = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
            inner: StaticResolver::new().with_mapping("intranet.example", vec![v4(10, 1, 2, 3)]),
        });
        let config =
            RouterConfig::new().with_custom_rule(CustomRule::new(Mode::Direct, ["10.0.0.0/8"]));
        let options = RouterOptions::new()
            .with_resolvers(ResolverRegistry::new().with_resolver("proxy", resolver.clone()));
        let router = Router::new(config, options);

        let mut ctx = MatchContext::new();
        assert_eq!(dispatch(&router, "intranet.example", &mut ctx).mode(), Mode::Direct);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);

        // lookup failure is a miss
        let mut ctx = MatchContext::new();
        assert_eq!(dispatch(&router, "unknown.example", &mut ctx).mode(), Mode::Proxy);

        // cancelled lookups never reach the resolver
        let cancel = Arc::new(AtomicBool::new(true));
        let mut ctx = MatchContext::new().with_cancel(cancel);
        assert_eq!(dispatch(&router, "intranet.example", &mut ctx).mode(), Mode::Proxy);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_process_rules() {
        let config = RouterConfig::new().with_custom_rule(
            CustomRule::new(Mode::Direct, ["process:/usr/bin/curl"]).with_tag("tools"),
        );
        let options = RouterOptions::new()
            .with_process_dumper(Arc::new(FixedDumper("/usr/bin/curl (deleted)")));
        let router = Router::new(config, options);
        let source: SocketAddr = "192.168.1.10:50000".parse().unwrap();

        let mut ctx = MatchContext::new().with_source(source);
        let out = router.dispatch(Network::Tcp, Address::ip(v4(93, 184, 216, 34), 443), &mut ctx);
        assert_eq!(out.mode(), Mode::Direct);
        assert_eq!(out.tag(), Some("tools"));
        assert_eq!(ctx.reason, MatchReason::ProcessTrie);
        assert_eq!(ctx.process_name.as_deref(), Some("/usr/bin/curl"));

        // sniffing wins over the process rule
        let mut ctx = MatchContext::new()
            .with_source(source)
            .with_sniffed_mode(Mode::Block);
        assert_eq!(dispatch(&router, "example.org", &mut ctx).mode(), Mode::Block);

        // no source, no lookup
        let mut ctx = MatchContext::new();
        assert_eq!(dispatch(&router, "example.org", &mut ctx).mode(), Mode::Proxy);
        assert!(ctx.process_name.is_none());
    }

    #[test]
    fn test_process_rule_ignored_when_blocked() {
        let router = router_with(vec![
            CustomRule::new(Mode::Block, ["ads.example"]),
            CustomRule::new(Mode::Direct, ["process:/usr/bin/curl"]),
        ]);

        let mut ctx = MatchContext::new().with_process_name("/usr/bin/curl");
        assert_eq!(dispatch(&router, "ads.example", &mut ctx).mode(), Mode::Block);

        let mut ctx = MatchContext::new().with_process_name("/usr/bin/curl");
        assert_eq!(dispatch(&router, "example.org", &mut ctx).mode(), Mode::Direct);
    }

    #[test]
    fn test_skip_resolve() {
        assert!(!skip_resolve(UdpFqdnStrategy::Default, UdpFqdnStrategy::Default));
        assert!(skip_resolve(UdpFqdnStrategy::Default, UdpFqdnStrategy::SkipResolve));
        assert!(skip_resolve(UdpFqdnStrategy::SkipResolve, UdpFqdnStrategy::Default));
        assert!(!skip_resolve(UdpFqdnStrategy::SkipResolve, UdpFqdnStrategy::Resolve));

        let config = RouterConfig::new()
            .with_udp_proxy_fqdn(UdpFqdnStrategy::SkipResolve)
            .with_custom_rule(
                CustomRule::new(Mode::Proxy, ["resolve.example"])
                    .with_udp_proxy_fqdn(UdpFqdnStrategy::Resolve),
            )
            .with_custom_rule(CustomRule::new(Mode::Direct, ["direct.example"]));
        let router = Router::new(config, RouterOptions::new());

        let mut ctx = MatchContext::new();
        router.dispatch(Network::Udp, Address::domain("other.example", 53), &mut ctx);
        assert!(ctx.skip_resolve);

        let mut ctx = MatchContext::new();
        router.dispatch(Network::Udp, Address::domain("resolve.example", 53), &mut ctx);
        assert!(!ctx.skip_resolve);

        let mut ctx = MatchContext::new();
        router.dispatch(Network::Udp, Address::domain("direct.example", 53), &mut ctx);
        assert!(!ctx.skip_resolve);
    }

    #[test]
    fn test_resolver_selection_and_preference() {
        let resolvers = ResolverRegistry::new()
            .with_resolver("proxy", Arc::new(StaticResolver::new()))
            .with_resolver("direct", Arc::new(StaticResolver::new()))
            .with_resolver("cloudflare", Arc::new(StaticResolver::new()));
        let config = RouterConfig::new()
            .with_custom_rule(CustomRule::new(Mode::Proxy, ["a.example"]).with_resolver("cloudflare"))
            .with_custom_rule(CustomRule::new(Mode::Proxy, ["b.example"]).with_resolver("missing"))
            .with_custom_rule(
                CustomRule::new(Mode::Direct, ["c.example"])
                    .with_resolve_strategy(ResolveStrategy::OnlyIpv6),
            );
        let router = Router::new(config, RouterOptions::new().with_resolvers(resolvers));

        let mut ctx = MatchContext::new();
        dispatch(&router, "a.example", &mut ctx);
        assert_eq!(ctx.resolver.as_deref(), Some("cloudflare"));
        assert_eq!(ctx.resolver_preference, ResolverPreference::PreferIpv4);

        let mut ctx = MatchContext::new();
        dispatch(&router, "b.example", &mut ctx);
        assert_eq!(ctx.resolver.as_deref(), Some("proxy"));

        let mut ctx = MatchContext::new();
        dispatch(&router, "c.example", &mut ctx);
        assert_eq!(ctx.resolver.as_deref(), Some("direct"));
        assert_eq!(ctx.resolver_preference, ResolverPreference::PreferIpv6);

        assert_eq!(
            resolver_preference(ResolveStrategy::Default, true),
            ResolverPreference::Default
        );
    }

    #[test]
    fn test_block_records_history() {
        let router = router_with(vec![CustomRule::new(Mode::Block, ["ads.example"])]);

        let mut ctx = MatchContext::new().with_process_name("/usr/bin/app");
        dispatch(&router, "ads.example", &mut ctx);
        dispatch(&router, "example.org", &mut MatchContext::new());

        let entries = router.reject_history().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].network, "tcp");
        assert_eq!(entries[0].host, "ads.example:443");
        assert_eq!(entries[0].process.as_deref(), Some("/usr/bin/app"));
    }

    #[test]
    fn test_resolve_locally() {
        let resolver = StaticResolver::new().with_mapping("example.org", vec![v4(203, 0, 113, 5)]);
        let config = RouterConfig::new()
            .with_resolve_locally(true)
            .with_custom_rule(CustomRule::new(Mode::Direct, ["direct.example"]));
        let options = RouterOptions::new()
            .with_resolvers(ResolverRegistry::new().with_resolver("proxy", Arc::new(resolver)));
        let router = Router::new(config, options);

        let mut ctx = MatchContext::new();
        let out = dispatch(&router, "example.org", &mut ctx);
        assert_eq!(out.address, Address::ip(v4(203, 0, 113, 5), 443));
        assert_eq!(ctx.domain.as_deref(), Some("example.org"));
        assert_eq!(ctx.ip, Some(v4(203, 0, 113, 5)));

        // failure keeps the hostname
        let mut ctx = MatchContext::new();
        let out = dispatch(&router, "unknown.example", &mut ctx);
        assert_eq!(out.address, Address::domain("unknown.example", 443));
        assert!(ctx.ip.is_none());

        // direct traffic is left alone
        let mut ctx = MatchContext::new();
        let out = dispatch(&router, "direct.example", &mut ctx);
        assert!(out.address.is_fqdn());

        let cancel = Arc::new(AtomicBool::new(true));
        let mut ctx = MatchContext::new().with_cancel(cancel);
        assert!(dispatch(&router, "example.org", &mut ctx).address.is_fqdn());
    }

    #[test]
    fn test_bypass_rule_becomes_proxy() {
        let router = router_with(vec![CustomRule::new(Mode::Bypass, ["odd.example"]).with_tag("hk")]);

        let mut ctx = MatchContext::new();
        let out = dispatch(&router, "odd.example", &mut ctx);
        assert_eq!(out.mode(), Mode::Proxy);
        assert_eq!(out.tag(), Some("hk"));
        assert_eq!(ctx.mode, Mode::Proxy);
    }

    #[test]
    fn test_update_custom_rules() {
        let rules = vec![CustomRule::new(Mode::Block, ["ads.example"]).with_tag("ads")];
        let router = router_with(rules.clone());

        assert!(!router.update_custom_rules(rules.clone(), false));
        assert!(router.update_custom_rules(rules, true));

        let replaced = vec![CustomRule::new(Mode::Direct, ["ads.example"]).with_tag("fixed")];
        assert!(router.update_custom_rules(replaced.clone(), false));
        assert_eq!(router.search(&Host::parse("ads.example")).mode, Mode::Direct);
        assert_eq!(router.config().custom_rules, replaced);
        assert_eq!(router.tags().into_iter().collect::<Vec<_>>(), vec!["fixed"]);
    }

    #[test]
    fn test_reload_rule_file() {
        let path = temp_path("reload");
        let _ = fs::remove_file(&path);
        let router = Router::new(RouterConfig::new().with_rule_file(&path), RouterOptions::new());

        // missing file falls back to the built-in LAN rules
        let lan = router.search(&Host::parse("192.168.1.1"));
        assert_eq!(lan.mode, Mode::Direct);
        assert_eq!(lan.tag(), Some("LAN"));
        assert!(!router.reload_rule_file(false));

        fs::write(&path, "192.168.0.0/16 block\n").unwrap();
        assert!(router.reload_rule_file(false));
        assert_eq!(router.search(&Host::parse("192.168.1.1")).mode, Mode::Block);
        assert!(!router.reload_rule_file(false));
        assert!(router.reload_rule_file(true));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_apply_config() {
        let router = Router::new(RouterConfig::new(), RouterOptions::new());
        assert!(!router.apply(RouterConfig::new(), false));

        let config = RouterConfig::new()
            .with_network_modes(Mode::Direct, Mode::Direct)
            .with_custom_rule(CustomRule::new(Mode::Proxy, ["x.example"]).with_tag("jp"));
        assert!(router.apply(config.clone(), false));
        assert_eq!(router.tags().len(), 1);
        assert_eq!(*router.config(), config);

        let mut ctx = MatchContext::new();
        assert_eq!(dispatch(&router, "x.example", &mut ctx).mode(), Mode::Direct);
    }

    #[test]
    fn test_resolver_for() {
        let resolvers = ResolverRegistry::new()
            .with_resolver("proxy", Arc::new(StaticResolver::new()))
            .with_resolver(
                "direct",
                Arc::new(StaticResolver::new().with_mapping("lan.example", vec![v4(192, 168, 1, 2)])),
            );
        let config = RouterConfig::new()
            .with_custom_rule(CustomRule::new(Mode::Direct, ["lan.example"]))
            .with_custom_rule(CustomRule::new(Mode::Block, ["ads.example"]));
        let router = Router::new(config, RouterOptions::new().with_resolvers(resolvers));

        assert!(router.resolver_for("example.org", None).is_some());
        assert!(router.resolver_for("ads.example", Some("/usr/bin/app")).is_none());

        let entries = router.reject_history().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].network, "dns");
        assert_eq!(entries[0].host, "ads.example");

        let ips = router.lookup_ip("lan.example", &LookupOptions::default()).unwrap();
        assert_eq!(ips, vec![v4(192, 168, 1, 2)]);
        assert!(router.lookup_ip("ads.example", &LookupOptions::default()).is_err());
    }

    #[test]
    fn test_dial_through_selector() {
        let router = router_with(vec![CustomRule::new(Mode::Block, ["ads.example"])]);
        let mut ctx = MatchContext::new();
        match router.dial_tcp(Address::domain("ads.example", 80), &mut ctx) {
            Err(RouteError::OutboundError { kind, .. }) => assert_eq!(kind, OutboundErrorKind::NotFound),
            _ => panic!("expected missing selector"),
        }

        let config =
            RouterConfig::new().with_custom_rule(CustomRule::new(Mode::Block, ["ads.example"]));
        let options = RouterOptions::new().with_selector(Arc::new(StaticSelector::default()));
        let router = Router::new(config, options);
        let mut ctx = MatchContext::new();
        match router.dial_udp(Address::domain("ads.example", 53), &mut ctx) {
            Err(RouteError::OutboundError { kind, .. }) => assert_eq!(kind, OutboundErrorKind::Rejected),
            _ => panic!("expected rejection"),
        }
        assert_eq!(router.reject_history().total(), 1);
    }

    /// Connects every dial to a local listener and records the target.
    struct Loopback {
        listener: std::net::TcpListener,
        dialed: Mutex<Vec<Address>>,
    }

    impl Outbound for Loopback {
        fn dial_tcp(&self, addr: &Address) -> Result<TcpStream> {
            self.dialed.lock().push(addr.clone());
            Ok(TcpStream::connect(self.listener.local_addr()?)?)
        }

        fn dial_udp(&self, addr: &Address) -> Result<UdpSocket> {
            self.dialed.lock().push(addr.clone());
            Ok(UdpSocket::bind("127.0.0.1:0")?)
        }
    }

    #[test]
    fn test_dial_uses_dispatched_address() {
        let loopback = Arc::new(Loopback {
            listener: std::net::TcpListener::bind("127.0.0.1:0").unwrap(),
            dialed: Mutex::new(Vec::new()),
        });
        let selector = StaticSelector::default().with_outbound("proxy", loopback.clone());
        let resolver = StaticResolver::new().with_mapping("example.org", vec![v4(203, 0, 113, 5)]);
        let config = RouterConfig::new().with_resolve_locally(true);
        let options = RouterOptions::new()
            .with_selector(Arc::new(selector))
            .with_resolvers(ResolverRegistry::new().with_resolver("proxy", Arc::new(resolver)));
        let router = Router::new(config, options);

        let mut ctx = MatchContext::new();
        let stream = router
            .dial_tcp(Address::domain("example.org", 443), &mut ctx)
            .unwrap();
        assert_eq!(
            stream.peer_addr().unwrap(),
            loopback.listener.local_addr().unwrap()
        );

        let mut ctx = MatchContext::new();
        router
            .dial_udp(Address::domain("unknown.example", 53), &mut ctx)
            .unwrap();

        assert_eq!(
            *loopback.dialed.lock(),
            vec![
                Address::ip(v4(203, 0, 113, 5), 443),
                Address::domain("unknown.example", 53),
            ]
        );
    }

    /// Swaps the custom rules from inside its first lookup.
    struct SwappingResolver {
        router: Mutex<std::sync::Weak<Router>>,
        pending: Mutex<Option<Vec<CustomRule>>>,
    }

    impl Resolver for SwappingResolver {
        fn lookup_ip(&self, _host: &str, _opts: &LookupOptions) -> Result<Vec<IpAddr>> {
            let pending = self.pending.lock().take();
            if let (Some(rules), Some(router)) = (pending, self.router.lock().upgrade()) {
                assert!(router.update_custom_rules(rules, false));
            }
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_reload_during_dispatch_uses_one_snapshot() {
        let swapping = Arc::new(SwappingResolver {
            router: Mutex::new(std::sync::Weak::new()),
            pending: Mutex::new(Some(vec![
                CustomRule::new(Mode::Direct, ["process:/usr/bin/curl"]).with_tag("new"),
                CustomRule::new(Mode::Block, ["host.example"]).with_tag("new"),
            ])),
        });
        let config = RouterConfig::new()
            .with_custom_rule(CustomRule::new(Mode::Direct, ["10.0.0.0/8"]).with_tag("old"));
        let options = RouterOptions::new()
            .with_resolvers(ResolverRegistry::new().with_resolver("proxy", swapping.clone()));
        let router = Arc::new(Router::new(config, options));
        *swapping.router.lock() = Arc::downgrade(&router);

        // the swap lands during the rule stage; the process stage must not see it
        let mut ctx = MatchContext::new().with_process_name("/usr/bin/curl");
        let out = dispatch(&router, "host.example", &mut ctx);
        assert_eq!(out.mode(), Mode::Proxy);
        assert_eq!(out.tag(), None);
        assert_eq!(ctx.reason, MatchReason::Default);

        // later lookups see the new rules whole
        let mut ctx = MatchContext::new().with_process_name("/usr/bin/curl");
        let out = dispatch(&router, "host.example", &mut ctx);
        assert_eq!(out.mode(), Mode::Block);
        assert_eq!(out.tag(), Some("new"));
    }
}
