//! Label trie for hostname (and path) patterns.
//!
//! Patterns come in two shapes, each kept in its own tree:
//! - exact-leading: `www.example.com`, `last.example.*`
//! - wildcard-leading: `*.example.com`, `*.example.*`
//!
//! A leading `*` matches the suffix itself and anything to its left; a `*`
//! elsewhere is a gap that absorbs one or more labels. Exact leaves win
//! over wildcard leaves, and the exact-leading tree is searched first.
//!
//! ## Example
//!
//! ```
//! use route_engine_r::matcher::DomainTrie;
//!
//! let mut trie = DomainTrie::new();
//! trie.insert("*.baidu.com", "A");
//! trie.insert("www.baidu.com", "B");
//! trie.insert("last.baidu.*", "C");
//!
//! assert_eq!(trie.search("www.baidu.com"), Some(&"B"));
//! assert_eq!(trie.search("music.baidu.com"), Some(&"A"));
//! assert_eq!(trie.search("last.baidu.com.cn"), Some(&"C"));
//! assert_eq!(trie.search("music.163.com"), None);
//! ```

mod node;

use super::label::{LabelReader, DOT};
use node::{Node, GAP};

/// Two-rooted label trie.
#[derive(Debug, Clone)]
pub struct DomainTrie<T> {
    root: Node<T>,
    wildcard_root: Node<T>,
    sep: u8,
}

impl<T> Default for DomainTrie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DomainTrie<T> {
    /// Trie over dot-separated hostname labels.
    pub fn new() -> Self {
        Self::with_separator(DOT)
    }

    /// Trie over labels split by `sep` (e.g. `/` for process paths).
    pub fn with_separator(sep: u8) -> Self {
        Self {
            root: Node::default(),
            wildcard_root: Node::default(),
            sep,
        }
    }

    /// Insert a pattern, returning the value it replaced.
    /// Empty patterns are ignored.
    pub fn insert(&mut self, pattern: &str, value: T) -> Option<T> {
        if pattern.is_empty() {
            return None;
        }
        let sep = self.sep;
        let mut reader = LabelReader::new(pattern, sep);
        self.tree_mut(pattern).insert(&mut reader, value)
    }

    /// Look up a name. Callers normalise case.
    pub fn search(&self, name: &str) -> Option<&T> {
        let mut reader = LabelReader::new(name, self.sep);
        if let Some(found) = self.root.search(&mut reader) {
            return Some(found);
        }
        reader.reset();
        self.wildcard_root.search(&mut reader)
    }

    /// Remove a pattern previously inserted, returning its value.
    pub fn remove(&mut self, pattern: &str) -> Option<T> {
        if pattern.is_empty() {
            return None;
        }
        let mut reader = LabelReader::new(pattern, self.sep);
        self.tree_mut(pattern).remove(&mut reader)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty() && self.wildcard_root.is_empty()
    }

    fn tree_mut(&mut self, pattern: &str) -> &mut Node<T> {
        if is_wildcard_leading(pattern, self.sep) {
            &mut self.wildcard_root
        } else {
            &mut self.root
        }
    }
}

fn is_wildcard_leading(pattern: &str, sep: u8) -> bool {
    pattern
        .as_bytes()
        .split(|b| *b == sep)
        .next()
        .is_some_and(|first| first == GAP.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::label::SLASH;

    #[test]
    fn test_exact_beats_wildcard() {
        let mut trie = DomainTrie::new();
        trie.insert("*.baidu.com", 'A');
        trie.insert("www.baidu.com", 'B');

        assert_eq!(trie.search("www.baidu.com"), Some(&'B'));
        assert_eq!(trie.search("x.www.baidu.com"), Some(&'A'));
        assert_eq!(trie.search("baidu.com"), Some(&'A'));
    }

    #[test]
    fn test_exact_leaf_requires_full_consumption() {
        let mut trie = DomainTrie::new();
        trie.insert("baidu.com", 1);

        assert_eq!(trie.search("baidu.com"), Some(&1));
        assert_eq!(trie.search("www.baidu.com"), None);
        assert_eq!(trie.search("com"), None);
    }

    #[test]
    fn test_gap_absorbs_labels() {
        let mut trie = DomainTrie::new();
        trie.insert("last.baidu.*", 'C');

        assert_eq!(trie.search("last.baidu.com.cn"), Some(&'C'));
        assert_eq!(trie.search("last.baidu.com"), Some(&'C'));
        assert_eq!(trie.search("first.baidu.com"), None);
        assert_eq!(trie.search("baidu.com"), None);
    }

    #[test]
    fn test_wildcard_with_trailing_gap() {
        let mut trie = DomainTrie::new();
        trie.insert("*.baidu.*", 'D');
        trie.insert("spo.baidu.com", 'E');

        assert_eq!(trie.search("spo.baidu.com"), Some(&'E'));
        assert_eq!(trie.search("www.baidu.cn"), Some(&'D'));
        assert_eq!(trie.search("www.baidu.com.cn"), Some(&'D'));
    }

    #[test]
    fn test_no_backtracking_after_literal_descent() {
        let mut trie = DomainTrie::new();
        trie.insert("*.google.*", 1);
        trie.insert("mail.google.com", 2);

        // `com` is consumed literally in the exact tree, so the miss on
        // `www` ends that tree; the wildcard tree then answers.
        assert_eq!(trie.search("www.google.com"), Some(&1));
    }

    #[test]
    fn test_independent_wildcard_tree() {
        let mut trie = DomainTrie::new();
        trie.insert("*.baidu.com", 'X');
        assert_eq!(trie.search("music.163.com"), None);
    }

    #[test]
    fn test_reinsert_overwrites() {
        let mut trie = DomainTrie::new();
        assert_eq!(trie.insert("example.com", 1), None);
        assert_eq!(trie.insert("example.com", 2), Some(1));
        assert_eq!(trie.search("example.com"), Some(&2));
    }

    #[test]
    fn test_literal_star_inside_label() {
        let mut trie = DomainTrie::new();
        trie.insert("*abc.com", 1);

        assert_eq!(trie.search("*abc.com"), Some(&1));
        assert_eq!(trie.search("xabc.com"), None);
    }

    #[test]
    fn test_remove_prunes_empty_branches() {
        let mut trie = DomainTrie::new();
        trie.insert("a.b.example.com", 1);
        trie.insert("example.com", 2);

        assert_eq!(trie.remove("a.b.example.com"), Some(1));
        assert_eq!(trie.search("a.b.example.com"), None);
        assert_eq!(trie.search("example.com"), Some(&2));

        assert_eq!(trie.remove("example.com"), Some(2));
        assert!(trie.is_empty());
    }

    #[test]
    fn test_remove_keeps_shared_prefix() {
        let mut trie = DomainTrie::new();
        trie.insert("*.example.com", 1);
        trie.insert("*.api.example.com", 2);

        assert_eq!(trie.remove("*.example.com"), Some(1));
        assert_eq!(trie.search("v1.api.example.com"), Some(&2));
        assert_eq!(trie.search("www.example.com"), None);
    }

    #[test]
    fn test_remove_unknown_pattern() {
        let mut trie: DomainTrie<i32> = DomainTrie::new();
        trie.insert("example.com", 1);
        assert_eq!(trie.remove("other.com"), None);
        assert_eq!(trie.remove("*.example.com"), None);
        assert_eq!(trie.search("example.com"), Some(&1));
    }

    #[test]
    fn test_remove_very_long_pattern() {
        let mut trie = DomainTrie::new();
        let long = vec!["a"; 2_000].join(".");
        trie.insert(&long, 1);
        assert_eq!(trie.search(&long), Some(&1));
        assert_eq!(trie.remove(&long), Some(1));
        assert!(trie.is_empty());
    }

    #[test]
    fn test_path_separator() {
        let mut trie = DomainTrie::with_separator(SLASH);
        trie.insert("usr/bin/curl", 'C');
        trie.insert("*/chrome", 'G');
        trie.insert("opt/firefox/*", 'F');

        assert_eq!(trie.search("usr/bin/curl"), Some(&'C'));
        assert_eq!(trie.search("usr/local/bin/curl"), None);
        assert_eq!(trie.search("opt/google/chrome"), Some(&'G'));
        assert_eq!(trie.search("opt/firefox/bin/firefox-bin"), Some(&'F'));
        assert_eq!(trie.search("opt/mozilla/firefox"), None);
    }
}
