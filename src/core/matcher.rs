//! Keyword matching and context windowing.
//!
//! Scans a transcript for trigger keywords and yields a bounded word window
//! around each occurrence:
//! - Case-insensitive, whole-word comparison on whitespace tokens
//! - Surrounding punctuation is ignored, so `TB,` and `(tb)` match `TB`
//! - Multi-word keywords match consecutive tokens
//! - Every occurrence of every keyword yields its own match, overlaps included

use crate::config::KeywordSettings;
use crate::domain::{ContextMatch, MatchScope, Transcript};

/// A configured keyword and its cleaned token sequence
#[derive(Debug, Clone)]
struct Keyword {
    label: String,
    tokens: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct KeywordMatcher {
    keywords: Vec<Keyword>,
    window: usize,
    filter_enabled: bool,
}

/// Lowercase a token, keeping only alphanumerics, `-` and `_`
pub fn clean_token(token: &str) -> String {
    token
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
        .flat_map(char::to_lowercase)
        .collect()
}

impl KeywordMatcher {
    pub fn new(keywords: &[String], window: usize, filter_enabled: bool) -> Self {
        let keywords = keywords
            .iter()
            .filter_map(|label| {
                let tokens: Vec<String> = label
                    .split_whitespace()
                    .map(clean_token)
                    .filter(|t| !t.is_empty())
                    .collect();
                if tokens.is_empty() {
                    None
                } else {
                    Some(Keyword {
                        label: label.trim().to_string(),
                        tokens,
                    })
                }
            })
            .collect();

        Self {
            keywords,
            window,
            filter_enabled,
        }
    }

    pub fn from_settings(settings: &KeywordSettings) -> Self {
        Self::new(
            &settings.primary_keywords,
            settings.context_window_words,
            settings.filter_enabled,
        )
    }

    pub fn filter_enabled(&self) -> bool {
        self.filter_enabled
    }

    /// Lazily yield every context match in `transcript`, in text order.
    ///
    /// With filtering disabled, yields a single whole-transcript match.
    pub fn matches<'a>(
        &'a self,
        transcript: &'a Transcript,
    ) -> Box<dyn Iterator<Item = ContextMatch> + 'a> {
        if !self.filter_enabled {
            return Box::new(std::iter::once(ContextMatch::whole(transcript)));
        }

        let raw: Vec<&'a str> = transcript.text.split_whitespace().collect();
        let cleaned: Vec<String> = raw.iter().map(|t| clean_token(t)).collect();
        let window = self.window;

        Box::new((0..raw.len()).flat_map(move |pos| {
            self.keywords
                .iter()
                .filter(|kw| {
                    pos + kw.tokens.len() <= cleaned.len()
                        && kw
                            .tokens
                            .iter()
                            .zip(&cleaned[pos..])
                            .all(|(want, got)| want == got)
                })
                .map(|kw| {
                    let end = pos + kw.tokens.len();
                    ContextMatch {
                        keyword: kw.label.clone(),
                        matched: raw[pos..end].join(" "),
                        before: raw[pos.saturating_sub(window)..pos].join(" "),
                        after: raw[end..(end + window).min(raw.len())].join(" "),
                        source_transcript_id: transcript.id.clone(),
                        scope: MatchScope::Keyword,
                    }
                })
                .collect::<Vec<_>>()
        }))
    }

    /// Whether the transcript should be sent for extraction at all
    pub fn has_match(&self, transcript: &Transcript) -> bool {
        self.matches(transcript).next().is_some()
    }
}
