use std::collections::HashMap;

use super::super::label::LabelReader;

/// Structural child that lets a search skip labels.
pub(crate) const GAP: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Symbol {
    #[default]
    Unset,
    /// Matches only when every label has been consumed.
    Exact,
    /// Matches this suffix plus anything to its left.
    Wildcard,
}

#[derive(Debug, Clone)]
pub(crate) struct Node<T> {
    symbol: Symbol,
    mark: Option<T>,
    children: HashMap<String, Node<T>>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            symbol: Symbol::Unset,
            mark: None,
            children: HashMap::new(),
        }
    }
}

impl<T> Node<T> {
    pub(crate) fn is_empty(&self) -> bool {
        self.symbol == Symbol::Unset && self.children.is_empty()
    }

    fn set(&mut self, symbol: Symbol, mark: T) -> Option<T> {
        self.symbol = symbol;
        self.mark.replace(mark)
    }

    pub(crate) fn insert(&mut self, reader: &mut LabelReader<'_>, mark: T) -> Option<T> {
        let mut node = self;
        while reader.has_next() {
            let label = reader.current();
            if reader.is_last() && label == GAP {
                return node.set(Symbol::Wildcard, mark);
            }

            node = node.children.entry(label.to_string()).or_default();

            if reader.is_last() {
                return node.set(Symbol::Exact, mark);
            }
            reader.advance();
        }
        None
    }

    /// Longest wildcard match unless an exact leaf consumes every label.
    ///
    /// Before the first literal descent a single `*` child may be entered;
    /// while inside it unmatched labels are skipped. After a literal
    /// descent a mismatch ends the search.
    pub(crate) fn search(&self, reader: &mut LabelReader<'_>) -> Option<&T> {
        let mut node = self;
        let mut consumed = false;
        let mut in_gap = false;
        let mut best = None;

        while reader.has_next() {
            let label = reader.current();
            match node.children.get(label) {
                Some(child) => {
                    node = child;
                    match child.symbol {
                        Symbol::Wildcard => best = child.mark.as_ref(),
                        Symbol::Exact if reader.is_last() => return child.mark.as_ref(),
                        _ => {}
                    }
                    consumed = true;
                    reader.advance();
                }
                None if consumed => return best,
                None if !in_gap => {
                    in_gap = true;
                    match node.children.get(GAP) {
                        Some(gap) => node = gap,
                        None => return best,
                    }
                }
                None => {
                    reader.advance();
                }
            }
        }

        best
    }

    /// Clear the leaf written by the same pattern, pruning nodes left with
    /// neither children nor a mark. Iterative; depth is bounded only by the
    /// pattern length.
    pub(crate) fn remove(&mut self, reader: &mut LabelReader<'_>) -> Option<T> {
        let mut path: Vec<String> = Vec::new();
        let mut expected = Symbol::Exact;

        while reader.has_next() {
            let label = reader.current();
            if reader.is_last() && label == GAP {
                expected = Symbol::Wildcard;
                break;
            }
            path.push(label.to_string());
            if reader.is_last() {
                break;
            }
            reader.advance();
        }

        let target = self.descend_mut(&path)?;
        if target.symbol != expected {
            return None;
        }
        target.symbol = Symbol::Unset;
        let removed = target.mark.take();

        for depth in (0..path.len()).rev() {
            let Some(parent) = self.descend_mut(&path[..depth]) else {
                break;
            };
            let key = path[depth].as_str();
            if !parent.children.get(key).is_some_and(Node::is_empty) {
                break;
            }
            parent.children.remove(key);
        }

        removed
    }

    fn descend_mut(&mut self, path: &[String]) -> Option<&mut Node<T>> {
        let mut node = self;
        for key in path {
            node = node.children.get_mut(key.as_str())?;
        }
        Some(node)
    }
}
