//! Transcripts and the keyword contexts derived from them.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A single voice-to-text record fetched from the lifelog service.
///
/// Immutable once fetched; identity is the source's `id`, which is stable
/// across fetches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    /// Opaque identifier assigned by the source
    pub id: String,

    /// When the recording started
    pub timestamp: DateTime<Utc>,

    /// Markdown or plain-text body
    pub text: String,

    /// Title supplied by the source (if any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Transcript {
    pub fn new(id: impl Into<String>, timestamp: DateTime<Utc>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            timestamp,
            text: text.into(),
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Calendar date used as the reference point for relative dates
    pub fn reference_date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }

    /// Number of whitespace-delimited words in the body
    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

/// Whether a match covers a keyword occurrence or the whole body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchScope {
    /// A trigger keyword occurrence with a bounded window
    Keyword,

    /// Pseudo-match emitted when keyword filtering is disabled
    WholeTranscript,
}

/// A bounded word window around one keyword occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMatch {
    /// The configured trigger keyword that matched
    pub keyword: String,

    /// Token(s) exactly as they appeared in the text
    pub matched: String,

    /// Up to `context_window_words` words before the match
    pub before: String,

    /// Up to `context_window_words` words after the match
    pub after: String,

    pub source_transcript_id: String,

    pub scope: MatchScope,
}

impl ContextMatch {
    /// Pseudo-match covering the entire transcript body
    pub fn whole(transcript: &Transcript) -> Self {
        Self {
            keyword: String::new(),
            matched: String::new(),
            before: String::new(),
            after: transcript.text.clone(),
            source_transcript_id: transcript.id.clone(),
            scope: MatchScope::WholeTranscript,
        }
    }

    /// Context with the matched keyword highlighted, e.g. `... [TB] ...`
    pub fn full_context(&self) -> String {
        match self.scope {
            MatchScope::WholeTranscript => self.after.clone(),
            MatchScope::Keyword => {
                let mut parts = Vec::with_capacity(3);
                if !self.before.is_empty() {
                    parts.push(self.before.clone());
                }
                parts.push(format!("[{}]", self.matched));
                if !self.after.is_empty() {
                    parts.push(self.after.clone());
                }
                parts.join(" ")
            }
        }
    }

    pub fn before_word_count(&self) -> usize {
        self.before.split_whitespace().count()
    }

    pub fn after_word_count(&self) -> usize {
        self.after.split_whitespace().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_transcript_deserializes_without_title() {
        let json = r#"{"id":"abc","timestamp":"2025-01-20T09:30:00Z","text":"hello there"}"#;
        let transcript: Transcript = serde_json::from_str(json).unwrap();

        assert_eq!(transcript.id, "abc");
        assert!(transcript.title.is_none());
        assert_eq!(transcript.word_count(), 2);
        assert_eq!(
            transcript.reference_date(),
            NaiveDate::from_ymd_opt(2025, 1, 20).unwrap()
        );
    }

    #[test]
    fn test_full_context_highlights_keyword() {
        let m = ContextMatch {
            keyword: "TB".to_string(),
            matched: "tb,".to_string(),
            before: "remind me".to_string(),
            after: "to call Sam".to_string(),
            source_transcript_id: "t1".to_string(),
            scope: MatchScope::Keyword,
        };

        assert_eq!(m.full_context(), "remind me [tb,] to call Sam");
    }

    #[test]
    fn test_whole_transcript_match() {
        let t = Transcript::new(
            "t1",
            Utc.with_ymd_and_hms(2025, 1, 20, 0, 0, 0).unwrap(),
            "entire body of text",
        );
        let m = ContextMatch::whole(&t);

        assert_eq!(m.scope, MatchScope::WholeTranscript);
        assert_eq!(m.full_context(), "entire body of text");
        assert_eq!(m.before_word_count(), 0);
    }
}
