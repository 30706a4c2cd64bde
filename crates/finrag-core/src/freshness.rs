//! Freshness classification of questions.
//!
//! A question that mentions a temporal marker ("current", "latest",
//! "this quarter", ...) is about real-time data and gets the short cache
//! TTL; anything else is treated as historical.

use serde::{Deserialize, Serialize};

/// Case-insensitive words or word sequences that mark a question as
/// real-time.
pub const REAL_TIME_MARKERS: &[&str] = &[
    "current",
    "latest",
    "now",
    "today",
    "present",
    "recent",
    "this quarter",
    "this year",
    "this month",
    "this week",
];

/// Cache TTL class of an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    RealTime,
    Historical,
}

impl Freshness {
    pub fn is_real_time(&self) -> bool {
        matches!(self, Freshness::RealTime)
    }
}

/// Classify a question by scanning it for [`REAL_TIME_MARKERS`].
///
/// Markers match on word boundaries, so "now" does not match "known".
pub fn classify(question: &str) -> Freshness {
    let lower = question.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let real_time = REAL_TIME_MARKERS.iter().any(|marker| {
        let marker: Vec<&str> = marker.split_whitespace().collect();
        words.windows(marker.len()).any(|window| window == marker.as_slice())
    });

    if real_time {
        Freshness::RealTime
    } else {
        Freshness::Historical
    }
}
