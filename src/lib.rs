//! Route Engine - rule matching and route dispatch for user-space proxies
//!
//! For every outbound connection the engine decides where traffic goes
//! (block, direct, proxy, or a tagged proxy outbound) and how its DNS is
//! resolved. It provides:
//! - A hostname trie with wildcard labels that absorb label runs
//! - Longest-prefix-match tries for IPv4 and IPv6
//! - Rule sets published as atomically swapped snapshots
//! - A dispatcher combining forced modes, per-network defaults, rules,
//!   protocol sniffing and process rules
//!
//! # Example
//!
//! ```rust
//! use route_engine_r::{Address, CustomRule, MatchContext, Mode, Network, Router, RouterConfig, RouterOptions};
//!
//! let config = RouterConfig::new()
//!     .with_custom_rule(CustomRule::new(Mode::Proxy, ["*.google.com"]).with_tag("us"))
//!     .with_custom_rule(CustomRule::new(Mode::Direct, ["10.0.0.0/8", "localhost"]))
//!     .with_custom_rule(CustomRule::new(Mode::Block, ["ads.example"]));
//! let router = Router::new(config, RouterOptions::new());
//!
//! let mut ctx = MatchContext::new();
//! let out = router.dispatch(Network::Tcp, Address::domain("www.google.com", 443), &mut ctx);
//! assert_eq!(out.mode(), Mode::Proxy);
//! assert_eq!(out.tag(), Some("us"));
//!
//! // a forced mode wins over rules
//! let mut ctx = MatchContext::new().with_forced_mode(Mode::Direct);
//! let out = router.dispatch(Network::Tcp, Address::domain("ads.example", 80), &mut ctx);
//! assert_eq!(out.mode(), Mode::Direct);
//! ```
//!
//! # Rule Syntax
//!
//! Rule files hold one rule per line:
//! ```text
//! [file:|process:]pattern mode[,tag=name][,resolve_strategy=prefer_ipv6][,udp_proxy_fqdn][,resolver=name]
//! ```
//!
//! | Pattern | Example | Matches |
//! |---------|---------|---------|
//! | Hostname | `www.example.com` | That name only |
//! | Wildcard | `*.example.com` | One or more leading labels |
//! | Inner wildcard | `last.example.*` | Any label run in that position |
//! | IP / CIDR | `10.0.0.0/8`, `2001:db8::/32` | Longest prefix wins |
//! | Process | `process:/usr/bin/curl` | Connections owned by that executable |
//! | Pattern file | `file:lists/ads.txt` | Every pattern listed in the file |
//!
//! Modes are `direct`, `proxy`, `block` and `bypass`. `#` starts a comment;
//! malformed lines are skipped.

pub mod compile;
pub mod config;
pub mod error;
pub mod history;
pub mod matcher;
pub mod outbound;
pub mod parser;
pub mod process;
pub mod resolver;
pub mod router;
pub mod types;

// Re-export commonly used items
pub use compile::{compile, RuleSet, RuleSetBuilder};
pub use config::{CustomRule, RouterConfig};
pub use error::{OutboundErrorKind, Result, RouteError};
pub use history::{RejectEntry, RejectHistory};
pub use matcher::{CidrTrie, DomainTrie, Matcher, PrefixTrie};
pub use parser::{load_rule_file, parse_rules, parse_rules_from_file};
pub use types::{
    Address, Host, Mode, ModeDecision, Network, PatternKind, ResolveStrategy, ResolverPreference,
    TextRule, UdpFqdnStrategy,
};

// Re-export outbound types
pub use outbound::{Outbound, OutboundSelector, Reject, StaticSelector};

// Re-export resolver types
pub use resolver::{
    LookupOptions, NilResolver, Resolver, ResolverRegistry, StaticResolver, SystemResolver,
};

// Re-export process types
pub use process::{Process, ProcessDumper};

// Re-export router types
pub use router::{Dispatched, MatchContext, MatchReason, Router, RouterOptions};
