//! Sensitive-content pre-flight filter.
//!
//! Each dictionary owns one keyword automaton and an action. Dictionaries run
//! in configuration order over the text produced by the previous one.

use std::collections::BTreeSet;
use std::time::Duration;

use onerelay_common::{FilterSettings, KeywordMatch, KeywordMatcher};
use onerelay_provider_core::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FilterAction {
    Pass,
    Block,
    Replace,
    Context,
}

impl FilterAction {
    pub fn parse(mode: &str) -> Self {
        match mode.trim().to_ascii_uppercase().as_str() {
            "BLOCK" | "STRICT" => FilterAction::Block,
            "REPLACE" => FilterAction::Replace,
            "CONTEXT" | "MODERATE" => FilterAction::Context,
            _ => FilterAction::Pass,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterResult {
    pub action: FilterAction,
    pub modified: bool,
    pub new_text: String,
    pub reason: Option<String>,
    pub triggered_words: Vec<String>,
}

impl FilterResult {
    fn pass(text: &str) -> Self {
        Self {
            action: FilterAction::Pass,
            modified: false,
            new_text: text.to_string(),
            reason: None,
            triggered_words: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct Dictionary {
    name: String,
    action: FilterAction,
    matcher: KeywordMatcher,
    context_suffix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SensitiveFilter {
    enabled: bool,
    timeout: Duration,
    dictionaries: Vec<Dictionary>,
}

impl Default for SensitiveFilter {
    fn default() -> Self {
        Self::from_settings(&FilterSettings::default())
    }
}

impl SensitiveFilter {
    pub fn from_settings(settings: &FilterSettings) -> Self {
        let dictionaries = settings
            .dictionaries
            .iter()
            .map(|dict| Dictionary {
                name: dict.name.clone(),
                action: FilterAction::parse(&dict.mode),
                matcher: KeywordMatcher::new(&dict.words),
                context_suffix: dict.context_suffix.clone().filter(|s| !s.is_empty()),
            })
            .filter(|dict| !dict.matcher.is_empty())
            .collect();
        Self {
            enabled: settings.enabled,
            timeout: Duration::from_millis(settings.preflight_timeout_ms.max(1)),
            dictionaries,
        }
    }

    /// Whether a pre-flight pass has anything to do.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.dictionaries.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn check_text(&self, text: &str) -> FilterResult {
        let mut result = FilterResult::pass(text);
        let mut seen = BTreeSet::new();

        for dict in &self.dictionaries {
            let matches = dict.matcher.find_all(&result.new_text);
            if matches.is_empty() {
                continue;
            }
            for m in &matches {
                let word = dict.matcher.pattern(m.pattern).to_string();
                if seen.insert(word.clone()) {
                    result.triggered_words.push(word);
                }
            }

            match dict.action {
                FilterAction::Pass => {}
                FilterAction::Block => {
                    result.action = FilterAction::Block;
                    result.reason = Some(format!("blocked by dictionary {}", dict.name));
                    result.new_text = text.to_string();
                    result.modified = false;
                    return result;
                }
                FilterAction::Replace => {
                    result.new_text = remove_spans(&result.new_text, matches);
                    result.modified = true;
                }
                FilterAction::Context => {
                    if let Some(suffix) = &dict.context_suffix
                        && !result.new_text.ends_with(suffix.as_str())
                    {
                        result.new_text.push_str(suffix);
                        result.modified = true;
                    }
                }
            }
            if dict.action > result.action {
                result.action = dict.action;
                result.reason = Some(format!("matched dictionary {}", dict.name));
            }
        }
        result
    }

    /// Filters `text` in place; a blocking match becomes a caller error.
    pub fn apply(&self, text: &mut String) -> Result<FilterResult, RelayError> {
        let result = self.check_text(text);
        if result.action == FilterAction::Block {
            return Err(RelayError::local(
                400,
                "sensitive_words_detected",
                format!(
                    "sensitive words detected: {}",
                    result.triggered_words.join(", ")
                ),
            ));
        }
        if result.modified {
            text.clone_from(&result.new_text);
        }
        Ok(result)
    }
}

/// Leftmost-first removal; a span overlapping an earlier kept span is skipped.
fn remove_spans(text: &str, mut matches: Vec<KeywordMatch>) -> String {
    matches.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));
    let mut kept: Vec<(usize, usize)> = Vec::with_capacity(matches.len());
    let mut last_end = 0;
    for m in matches {
        if m.start < last_end {
            continue;
        }
        kept.push((m.start, m.end));
        last_end = m.end;
    }

    let mut spans = kept.into_iter().peekable();
    text.chars()
        .enumerate()
        .filter(|(index, _)| {
            while let Some(&(_, end)) = spans.peek() {
                if *index >= end {
                    spans.next();
                } else {
                    break;
                }
            }
            !matches!(spans.peek(), Some(&(start, end)) if *index >= start && *index < end)
        })
        .map(|(_, ch)| ch)
        .collect()
}
