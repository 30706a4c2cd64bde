//! Prompt context assembly.
//!
//! Turns ranked [`RetrievalMatch`]es into the text block handed to the
//! answer generator. Matches below [`RELEVANCE_FLOOR`] are dropped; if
//! nothing survives, the builder reports [`BuiltContext::Empty`] so the
//! pipeline can stop before calling the generator.

use crate::models::RetrievalMatch;

/// Minimum similarity for a match to be included in the context.
pub const RELEVANCE_FLOOR: f32 = 0.70;

/// Outcome of [`ContextBuilder::build`].
#[derive(Debug, Clone, PartialEq)]
pub enum BuiltContext {
    /// No match reached the relevance floor.
    Empty,
    /// Rendered context plus the ids of the documents it was built from,
    /// in ranked order.
    Ready { text: String, document_ids: Vec<String> },
}

impl BuiltContext {
    pub fn is_empty(&self) -> bool {
        matches!(self, BuiltContext::Empty)
    }
}

/// Renders ranked matches as labeled blocks separated by blank lines:
///
/// ```text
/// Apple 10-K (2023-09-30):
/// Net sales were $383.3 billion ...
///
/// Apple 10-Q (2024-03-30):
/// ...
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextBuilder;

impl ContextBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build a context from matches already ordered by descending score.
    pub fn build(&self, matches: &[RetrievalMatch]) -> BuiltContext {
        let mut blocks = Vec::new();
        let mut document_ids = Vec::new();

        for m in matches.iter().filter(|m| m.score >= RELEVANCE_FLOOR) {
            let meta = &m.metadata;
            blocks.push(format!(
                "{} {} ({}):\n{}",
                meta.company, meta.report_type, meta.report_date, meta.content
            ));
            document_ids.push(m.id.clone());
        }

        if blocks.is_empty() {
            return BuiltContext::Empty;
        }

        BuiltContext::Ready {
            text: blocks.join("\n\n"),
            document_ids,
        }
    }
}
