use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, RouteError};
use crate::types::{Mode, ModeDecision, PatternKind, TextRule, UdpFqdnStrategy};

/// Regex pattern for parsing rule lines
/// Format: [file:|process:]pattern mode[,key=value...]
/// The pattern may be quoted with `"` or `'` to allow spaces.
static RULE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^(?:(file|process):)?(?:"([^"]*)"|'([^']*)'|([^\s"']\S*))\s+(\S.*)$"#)
        .expect("RULE_PATTERN: hardcoded regex is invalid")
});

/// Maximum nesting depth for `file:` pattern references.
pub const MAX_INCLUDE_DEPTH: usize = 10;

/// Rules used when the configured rule file cannot be read.
pub const DEFAULT_RULES: &str = "
0.0.0.0/8 DIRECT,tag=LAN
10.0.0.0/8 DIRECT,tag=LAN
100.64.0.0/10 DIRECT,tag=LAN
127.0.0.0/8 DIRECT,tag=LAN
169.254.0.0/16 DIRECT,tag=LAN
172.16.0.0/12 DIRECT,tag=LAN
192.0.0.0/29 DIRECT,tag=LAN
192.0.2.0/24 DIRECT,tag=LAN
192.88.99.0/24 DIRECT,tag=LAN
192.168.0.0/16 DIRECT,tag=LAN
198.18.0.0/15 DIRECT,tag=LAN
198.51.100.0/24 DIRECT,tag=LAN
203.0.113.0/24 DIRECT,tag=LAN
224.0.0.0/3 DIRECT,tag=LAN
localhost DIRECT,tag=LAN
";

/// Parse rules from text.
///
/// Malformed lines and unknown modes are skipped. Relative `file:`
/// references are left as written.
pub fn parse_rules(text: &str) -> Vec<TextRule> {
    parse_rules_in(text, None)
}

fn parse_rules_in(text: &str, base: Option<&Path>) -> Vec<TextRule> {
    let mut rules = Vec::new();

    for (line_num, line) in text.lines().enumerate() {
        let line_num = line_num + 1; // 1-based line numbers

        let line = trim_comment(line).trim();
        if line.is_empty() {
            continue;
        }

        match parse_line(line, line_num) {
            Ok(mut rule) => {
                if rule.kind == PatternKind::File {
                    rule.pattern = resolve_relative(base, &rule.pattern)
                        .to_string_lossy()
                        .into_owned();
                }
                rules.push(rule);
            }
            Err(e) => debug!(line = line_num, error = %e, "skipping rule line"),
        }
    }

    rules
}

/// Parse rules from a file. Relative `file:` references resolve against
/// the file's directory.
pub fn parse_rules_from_file(path: impl AsRef<Path>) -> Result<Vec<TextRule>> {
    let path = path.as_ref();
    let text = read_file(path)?;
    Ok(parse_rules_in(&text, path.parent()))
}

/// Rules from `path`, falling back to [`DEFAULT_RULES`] when the file
/// cannot be read.
pub fn load_rule_file(path: impl AsRef<Path>) -> Vec<TextRule> {
    let path = path.as_ref();
    match parse_rules_from_file(path) {
        Ok(rules) => rules,
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "rule file unreadable, using built-in rules"
            );
            parse_rules(DEFAULT_RULES)
        }
    }
}

/// Parse a single comment-free, trimmed rule line.
pub fn parse_line(line: &str, line_num: usize) -> Result<TextRule> {
    let captures = RULE_PATTERN
        .captures(line)
        .ok_or_else(|| RouteError::ParseErrorAtLine {
            line: line_num,
            message: format!("Invalid rule format: {}", line),
        })?;

    let kind = match captures.get(1).map(|m| m.as_str()) {
        Some("file") => PatternKind::File,
        Some("process") => PatternKind::Process,
        _ => PatternKind::Host,
    };
    let pattern = captures
        .get(2)
        .or_else(|| captures.get(3))
        .or_else(|| captures.get(4))
        .map(|m| m.as_str().trim())
        .unwrap_or_default();
    if pattern.is_empty() {
        return Err(RouteError::ParseErrorAtLine {
            line: line_num,
            message: "Empty pattern".to_string(),
        });
    }

    let args = captures.get(5).map(|m| m.as_str()).unwrap_or_default();
    let decision = parse_decision(args).map_err(|e| RouteError::ParseErrorAtLine {
        line: line_num,
        message: e.to_string(),
    })?;

    Ok(TextRule {
        kind,
        pattern: pattern.to_string(),
        decision,
        line_num,
    })
}

/// Parse `mode[,tag=x][,resolve_strategy=s][,udp_proxy_fqdn[=bool]][,resolver=name]`.
///
/// Keys and the mode are case-insensitive; the tag and resolver name keep
/// their case. Unknown keys are ignored.
pub fn parse_decision(args: &str) -> Result<ModeDecision> {
    let mut fields = args.split(',').map(str::trim).filter(|f| !f.is_empty());

    let mode: Mode = fields
        .next()
        .ok_or_else(|| RouteError::InvalidRule("missing mode".to_string()))?
        .parse()?;
    let mut decision = ModeDecision::new(mode);

    for field in fields {
        let (key, value) = field
            .split_once('=')
            .map_or((field, "true"), |(k, v)| (k.trim(), v.trim()));

        match key.to_ascii_lowercase().as_str() {
            "tag" => decision = decision.with_tag(value),
            "resolver" => decision = decision.with_resolver(value),
            "resolve_strategy" => {
                decision.resolve_strategy = value.parse().unwrap_or_default();
            }
            "udp_proxy_fqdn" => {
                decision.udp_fqdn_strategy = if value.eq_ignore_ascii_case("true") {
                    UdpFqdnStrategy::SkipResolve
                } else {
                    UdpFqdnStrategy::Resolve
                };
            }
            other => debug!(key = other, "ignoring unknown rule argument"),
        }
    }

    Ok(decision)
}

/// Patterns listed in a pattern file, one per line, with nested `file:`
/// references expanded.
///
/// Only an unreadable `path` is an error. A nested reference that cannot be
/// read, or that nests deeper than [`MAX_INCLUDE_DEPTH`], is skipped with a
/// warning and the rest of the file is kept.
pub fn read_pattern_file(path: impl AsRef<Path>) -> Result<Vec<(PatternKind, String)>> {
    read_pattern_file_inner(path.as_ref(), 0)
}

fn read_pattern_file_inner(path: &Path, depth: usize) -> Result<Vec<(PatternKind, String)>> {
    let text = read_file(path)?;
    let mut patterns = Vec::new();

    for line in text.lines() {
        let line = trim_comment(line).trim();
        if line.is_empty() {
            continue;
        }

        match PatternKind::split(line) {
            (PatternKind::File, nested) => {
                let nested = resolve_relative(path.parent(), nested.trim());
                if depth >= MAX_INCLUDE_DEPTH {
                    warn!(
                        path = %nested.display(),
                        max = MAX_INCLUDE_DEPTH,
                        "pattern file nested too deep, possible circular include; skipping"
                    );
                    continue;
                }
                match read_pattern_file_inner(&nested, depth + 1) {
                    Ok(found) => patterns.extend(found),
                    Err(e) => warn!(
                        path = %nested.display(),
                        error = %e,
                        "skipping unreadable pattern file reference"
                    ),
                }
            }
            (kind, pattern) => patterns.push((kind, pattern.trim().to_string())),
        }
    }

    Ok(patterns)
}

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| {
        RouteError::ConfigError(format!(
            "Failed to read rules file '{}': {}",
            path.display(),
            e
        ))
    })
}

/// Text before the first `#` outside a quoted span.
fn trim_comment(line: &str) -> &str {
    let mut quote = None;
    for (pos, c) in line.char_indices() {
        match (quote, c) {
            (None, '#') => return &line[..pos],
            (None, '"' | '\'') => quote = Some(c),
            (Some(open), c) if c == open => quote = None,
            _ => {}
        }
    }
    line
}

fn resolve_relative(base: Option<&Path>, path: &str) -> PathBuf {
    let path = Path::new(path);
    match base {
        Some(base) if !path.is_absolute() => base.join(path),
        _ => path.to_path_buf(),
    }
}
