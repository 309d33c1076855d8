//! Turns raw upstream statuses into per-session client messages.
//!
//! Each status is reduced to two lowercase views: a signal text (letters plus `#`, `!`, `?` and
//! `'`) for the scorer, and a tag text (letters and `#` only) used both for keyword matching and
//! for hashtag counting. Mentions and URLs are removed before either view is built.

use std::{collections::BTreeMap, sync::Arc};

use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::trace;

use crate::{registry::SessionRegistry, session::SessionId, stopwords, upstream::IncomingEvent};

static MENTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"@\w*").expect("mention pattern"));
static URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://[A-Za-z0-9./]*").expect("url pattern"));

/// Sentiment of one status, in the shape of a VADER score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Polarity {
    pub neg: f64,
    pub neu: f64,
    pub pos: f64,
    pub compound: f64,
}

pub trait Scorer: Send + Sync {
    fn score(&self, text: &str) -> Polarity;
}

pub trait Aggregator: Send + Sync {
    /// Counts the interesting tokens among `tokens`. Stop-words have already been removed.
    fn frequencies(&self, tokens: &[&str]) -> BTreeMap<String, u32>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedText {
    pub signal: String,
    pub tags: String,
}

impl NormalizedText {
    pub fn tag_tokens(&self) -> impl Iterator<Item = &str> {
        self.tags.split_whitespace()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedMessage {
    pub polarity: Polarity,
    pub hashtags: BTreeMap<String, u32>,
    pub matched: Vec<SessionId>,
}

#[derive(Serialize)]
struct ClientPayload<'a> {
    #[serde(rename = "polarityIndex")]
    polarity: &'a Polarity,
    hashtags: &'a BTreeMap<String, u32>,
}

impl ProcessedMessage {
    /// JSON frame sent to every matched session.
    pub fn payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&ClientPayload {
            polarity: &self.polarity,
            hashtags: &self.hashtags,
        })
    }
}

/// Text the status should be judged on: the extended text when present, nothing for
/// retweets.
pub fn select_text(event: &IncomingEvent) -> Option<&str> {
    if event.is_retweet {
        return None;
    }
    match event.extended_text.as_deref() {
        Some(extended) if !extended.is_empty() => Some(extended),
        _ => Some(event.text.as_str()),
    }
}

pub fn normalize(text: &str) -> NormalizedText {
    let without_mentions = MENTION.replace_all(text, "");
    let stripped = URL.replace_all(&without_mentions, "");
    let signal = keep_chars(&stripped, |c| {
        c.is_ascii_alphabetic() || matches!(c, '#' | '!' | '?' | '\'')
    });
    let tags = keep_chars(&stripped, |c| c.is_ascii_alphabetic() || c == '#');
    NormalizedText { signal, tags }
}

fn keep_chars(text: &str, keep: impl Fn(char) -> bool) -> String {
    text.chars()
        .map(|c| if keep(c) { c.to_ascii_lowercase() } else { ' ' })
        .collect()
}

pub struct MessagePipeline {
    registry: Arc<SessionRegistry>,
    scorer: Arc<dyn Scorer>,
    aggregator: Arc<dyn Aggregator>,
}

impl MessagePipeline {
    pub fn new(
        registry: Arc<SessionRegistry>,
        scorer: Arc<dyn Scorer>,
        aggregator: Arc<dyn Aggregator>,
    ) -> Self {
        Self {
            registry,
            scorer,
            aggregator,
        }
    }

    /// Returns `None` for retweets and for statuses no session is interested in; those are
    /// never scored.
    pub fn process(&self, event: &IncomingEvent) -> Option<ProcessedMessage> {
        let Some(text) = select_text(event) else {
            counter!("track_mux_events_skipped_total", 1, "reason" => "retweet");
            return None;
        };
        let normalized = normalize(text);
        let matched = self.registry.matching(&normalized.tags);
        if matched.is_empty() {
            counter!("track_mux_events_skipped_total", 1, "reason" => "unmatched");
            trace!(target = "stream.pipeline", "status matched no session");
            return None;
        }

        let polarity = self.scorer.score(&normalized.signal);
        let tokens: Vec<&str> = normalized
            .tag_tokens()
            .filter(|token| !stopwords::is_stop_word(token))
            .collect();
        let hashtags = self.aggregator.frequencies(&tokens);
        counter!("track_mux_events_processed_total", 1);
        trace!(
            target = "stream.pipeline",
            matched = matched.len(),
            compound = polarity.compound,
            "status processed"
        );
        Some(ProcessedMessage {
            polarity,
            hashtags,
            matched,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedScorer;

    impl Scorer for FixedScorer {
        fn score(&self, text: &str) -> Polarity {
            Polarity {
                compound: if text.contains('!') { 0.5 } else { 0.0 },
                neu: 1.0,
                ..Polarity::default()
            }
        }
    }

    struct CountAll;

    impl Aggregator for CountAll {
        fn frequencies(&self, tokens: &[&str]) -> BTreeMap<String, u32> {
            let mut counts = BTreeMap::new();
            for token in tokens {
                *counts.entry(token.to_string()).or_insert(0) += 1;
            }
            counts
        }
    }

    fn pipeline(registry: Arc<SessionRegistry>) -> MessagePipeline {
        MessagePipeline::new(registry, Arc::new(FixedScorer), Arc::new(CountAll))
    }

    #[test_timeout::timeout]
    fn normalize_strips_mentions_urls_and_punctuation() {
        let normalized = normalize("@bob Look at THIS #Dog!! https://t.co/abc123 isn't it?");
        assert_eq!(normalized.signal.split_whitespace().collect::<Vec<_>>(), [
            "look", "at", "this", "#dog!!", "isn't", "it?"
        ]);
        assert_eq!(normalized.tag_tokens().collect::<Vec<_>>(), [
            "look", "at", "this", "#dog", "isn", "t", "it"
        ]);
    }

    #[test_timeout::timeout]
    fn select_text_prefers_extended_and_skips_retweets() {
        let mut event = IncomingEvent::new("short");
        assert_eq!(select_text(&event), Some("short"));
        event.extended_text = Some("the long version".into());
        assert_eq!(select_text(&event), Some("the long version"));
        event.is_retweet = true;
        assert_eq!(select_text(&event), None);
    }

    #[test_timeout::timeout]
    fn process_matches_on_tag_text() {
        let registry = Arc::new(SessionRegistry::new());
        registry.register(&"a".into(), "cat");
        registry.register(&"b".into(), "dog");

        let processed = pipeline(registry)
            .process(&IncomingEvent::new("I love my dog #Happy!"))
            .expect("dog session matches");
        assert_eq!(processed.matched, vec![SessionId::from("b")]);
        assert_eq!(processed.polarity.compound, 0.5);
        assert_eq!(processed.hashtags.get("#happy"), Some(&1));
        assert_eq!(processed.hashtags.get("my"), None, "stop-words are removed");
    }

    #[test_timeout::timeout]
    fn process_drops_unmatched_and_retweets() {
        let registry = Arc::new(SessionRegistry::new());
        registry.register(&"a".into(), "cat");
        let pipeline = pipeline(registry);

        assert!(pipeline.process(&IncomingEvent::new("only dogs here")).is_none());
        let retweet = IncomingEvent {
            text: "RT a cat".into(),
            extended_text: None,
            is_retweet: true,
        };
        assert!(pipeline.process(&retweet).is_none());
    }

    #[test_timeout::timeout]
    fn mention_of_keyword_does_not_match() {
        let registry = Arc::new(SessionRegistry::new());
        registry.register(&"a".into(), "cat");
        assert!(pipeline(registry)
            .process(&IncomingEvent::new("hello @catlover"))
            .is_none());
    }

    #[test_timeout::timeout]
    fn payload_uses_client_field_names() {
        let message = ProcessedMessage {
            polarity: Polarity {
                neg: 0.0,
                neu: 0.5,
                pos: 0.5,
                compound: 0.4,
            },
            hashtags: [("#dog".to_string(), 2)].into_iter().collect(),
            matched: vec!["a".into()],
        };
        let value: serde_json::Value =
            serde_json::from_str(&message.payload().unwrap()).unwrap();
        assert_eq!(value["polarityIndex"]["compound"], 0.4);
        assert_eq!(value["hashtags"]["#dog"], 2);
        assert!(value.get("matched").is_none());
    }
}
