//! Multi-pattern keyword search (Aho-Corasick automaton).
//!
//! Matching is case-insensitive and works on `char` positions, so reported
//! spans can be used directly to slice `text.chars()` for mixed-script input.

use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeywordMatch {
    /// Index into the patterns the matcher was built with.
    pub pattern: usize,
    /// Char index of the first matched char.
    pub start: usize,
    /// Char index one past the last matched char.
    pub end: usize,
}

#[derive(Debug, Default, Clone)]
struct Node {
    next: HashMap<char, usize>,
    fail: usize,
    outputs: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct KeywordMatcher {
    nodes: Vec<Node>,
    patterns: Vec<String>,
    lengths: Vec<usize>,
}

impl KeywordMatcher {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut matcher = Self {
            nodes: vec![Node::default()],
            patterns: Vec::new(),
            lengths: Vec::new(),
        };
        for pattern in patterns {
            let pattern = pattern.as_ref();
            if pattern.is_empty() {
                continue;
            }
            matcher.insert(pattern);
        }
        matcher.link();
        matcher
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn pattern(&self, index: usize) -> &str {
        &self.patterns[index]
    }

    /// Every occurrence, overlaps included, ordered by end position.
    pub fn find_all(&self, text: &str) -> Vec<KeywordMatch> {
        let mut found = Vec::new();
        self.scan(text, |m| {
            found.push(m);
            true
        });
        found
    }

    pub fn find_first(&self, text: &str) -> Option<KeywordMatch> {
        let mut first = None;
        self.scan(text, |m| {
            first = Some(m);
            false
        });
        first
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.find_first(text).is_some()
    }

    fn insert(&mut self, pattern: &str) {
        let mut state = 0;
        let mut len = 0;
        for ch in pattern.chars().map(fold) {
            len += 1;
            state = match self.nodes[state].next.get(&ch) {
                Some(next) => *next,
                None => {
                    self.nodes.push(Node::default());
                    let id = self.nodes.len() - 1;
                    self.nodes[state].next.insert(ch, id);
                    id
                }
            };
        }
        let index = self.patterns.len();
        self.patterns.push(pattern.to_string());
        self.lengths.push(len);
        self.nodes[state].outputs.push(index);
    }

    fn link(&mut self) {
        let mut queue = VecDeque::new();
        let roots: Vec<usize> = self.nodes[0].next.values().copied().collect();
        for child in roots {
            self.nodes[child].fail = 0;
            queue.push_back(child);
        }

        while let Some(state) = queue.pop_front() {
            let edges: Vec<(char, usize)> = self.nodes[state]
                .next
                .iter()
                .map(|(ch, next)| (*ch, *next))
                .collect();
            for (ch, child) in edges {
                let mut fail = self.nodes[state].fail;
                let target = loop {
                    if let Some(next) = self.nodes[fail].next.get(&ch) {
                        break *next;
                    }
                    if fail == 0 {
                        break 0;
                    }
                    fail = self.nodes[fail].fail;
                };
                self.nodes[child].fail = target;
                let inherited = self.nodes[target].outputs.clone();
                self.nodes[child].outputs.extend(inherited);
                queue.push_back(child);
            }
        }
    }

    fn scan(&self, text: &str, mut on_match: impl FnMut(KeywordMatch) -> bool) {
        if self.is_empty() {
            return;
        }
        let mut state = 0;
        for (pos, ch) in text.chars().map(fold).enumerate() {
            loop {
                if let Some(next) = self.nodes[state].next.get(&ch) {
                    state = *next;
                    break;
                }
                if state == 0 {
                    break;
                }
                state = self.nodes[state].fail;
            }
            for &pattern in &self.nodes[state].outputs {
                let end = pos + 1;
                let found = KeywordMatch {
                    pattern,
                    start: end - self.lengths[pattern],
                    end,
                };
                if !on_match(found) {
                    return;
                }
            }
        }
    }
}

fn fold(ch: char) -> char {
    ch.to_lowercase().next().unwrap_or(ch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_overlapping_patterns() {
        let matcher = KeywordMatcher::new(["he", "she", "his", "hers"]);
        let found: Vec<(&str, usize, usize)> = matcher
            .find_all("ushers")
            .into_iter()
            .map(|m| (matcher.pattern(m.pattern), m.start, m.end))
            .collect();
        assert!(found.contains(&("she", 1, 4)));
        assert!(found.contains(&("he", 2, 4)));
        assert!(found.contains(&("hers", 2, 6)));
        assert_eq!(found.len(), 3);
    }

    #[test]
    fn matching_ignores_case() {
        let matcher = KeywordMatcher::new(["Permission Denied"]);
        assert!(matcher.is_match("upstream said: PERMISSION denied for key"));
        assert!(!matcher.is_match("permission granted"));
    }

    #[test]
    fn reports_char_positions_for_multibyte_text() {
        let matcher = KeywordMatcher::new(["违规"]);
        let hit = matcher.find_first("这是违规内容").unwrap();
        assert_eq!((hit.start, hit.end), (2, 4));
    }

    #[test]
    fn empty_matcher_never_matches() {
        let matcher = KeywordMatcher::new(Vec::<String>::new());
        assert!(matcher.is_empty());
        assert!(!matcher.is_match("anything"));
    }
}
