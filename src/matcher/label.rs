//! Right-to-left label cursor.
//!
//! Hostnames are read TLD first (`www.example.com` yields `com`, `example`,
//! `www`); process paths use `/` as the separator and yield the file name
//! first.

/// Separator for hostname labels.
pub const DOT: u8 = b'.';
/// Separator for path segments.
pub const SLASH: u8 = b'/';

/// Cursor over the labels of a string, rightmost label first.
#[derive(Debug, Clone)]
pub struct LabelReader<'a> {
    text: &'a str,
    sep: u8,
    start: usize,
    /// Exclusive end of the current label; `None` once exhausted.
    end: Option<usize>,
}

impl<'a> LabelReader<'a> {
    pub fn new(text: &'a str, sep: u8) -> Self {
        let mut reader = Self {
            text,
            sep,
            start: 0,
            end: None,
        };
        reader.reset();
        reader
    }

    /// Reader over hostname labels.
    pub fn hostname(text: &'a str) -> Self {
        Self::new(text, DOT)
    }

    /// Rewind to the rightmost label.
    pub fn reset(&mut self) {
        let len = self.text.len();
        self.end = Some(len);
        self.start = self.label_start(len);
    }

    /// True while a current label is available.
    pub fn has_next(&self) -> bool {
        self.end.is_some()
    }

    /// True when the current label is the leftmost one.
    pub fn is_last(&self) -> bool {
        self.start == 0
    }

    /// The current label, or `""` once exhausted.
    pub fn current(&self) -> &'a str {
        match self.end {
            Some(end) => &self.text[self.start..end],
            None => "",
        }
    }

    /// Move one label to the left. Returns false when no label remains.
    pub fn advance(&mut self) -> bool {
        if self.end.is_none() || self.start == 0 {
            self.end = None;
            return false;
        }
        let end = self.start - 1;
        self.end = Some(end);
        self.start = self.label_start(end);
        true
    }

    fn label_start(&self, end: usize) -> usize {
        self.text.as_bytes()[..end]
            .iter()
            .rposition(|b| *b == self.sep)
            .map_or(0, |pos| pos + 1)
    }
}

impl<'a> Iterator for LabelReader<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.has_next() {
            return None;
        }
        let label = self.current();
        self.advance();
        Some(label)
    }
}
