//! Keyword-based ticket classification.

use regex_lite::Regex;

use crate::ticket::{Classification, Sentiment, Urgency};

/// Maps ticket text to urgency, sentiment and whether someone must act.
///
/// Implementations must be pure: the same input always yields the same output.
pub trait Classifier: Send + Sync {
    fn classify(&self, subject: Option<&str>, text: &str) -> Classification;
}

const HIGH_URGENCY: &[&str] = &["lawsuit", "gdpr", "urgent", "charged twice", "legal"];
const MEDIUM_URGENCY: &[&str] = &["refund", "cancel", "broken", "login issue"];
const NEGATIVE: &[&str] = &["angry", "broken", "terrible", "lawsuit", "worst"];
const POSITIVE: &[&str] = &["thank you", "thanks", "great", "love"];

/// Case-insensitive whole-word keyword matcher over subject and text.
pub struct KeywordClassifier {
    high_urgency: Regex,
    medium_urgency: Regex,
    negative: Regex,
    positive: Regex,
}

fn keyword_regex(words: &[&str]) -> Result<Regex, regex_lite::Error> {
    let alternatives = words
        .iter()
        .map(|w| regex_lite::escape(w))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b(?:{alternatives})\b"))
}

impl KeywordClassifier {
    pub fn new() -> Result<Self, regex_lite::Error> {
        Ok(Self {
            high_urgency: keyword_regex(HIGH_URGENCY)?,
            medium_urgency: keyword_regex(MEDIUM_URGENCY)?,
            negative: keyword_regex(NEGATIVE)?,
            positive: keyword_regex(POSITIVE)?,
        })
    }
}

impl Classifier for KeywordClassifier {
    fn classify(&self, subject: Option<&str>, text: &str) -> Classification {
        let haystack = match subject {
            Some(subject) => format!("{subject}\n{text}"),
            None => text.to_string(),
        };

        let urgency = if self.high_urgency.is_match(&haystack) {
            Urgency::High
        } else if self.medium_urgency.is_match(&haystack) {
            Urgency::Medium
        } else {
            Urgency::Low
        };

        // negative wins over positive ("thanks for nothing, this is broken")
        let sentiment = if self.negative.is_match(&haystack) {
            Sentiment::Negative
        } else if self.positive.is_match(&haystack) {
            Sentiment::Positive
        } else {
            Sentiment::Neutral
        };

        Classification {
            urgency,
            sentiment,
            requires_action: urgency != Urgency::Low,
        }
    }
}
