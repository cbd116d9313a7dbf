//! Deterministic in-process worker for standalone runs and demos.
//!
//! Translation tags the text with its language pair; summarization keeps
//! leading whole words up to the requested length.

use async_trait::async_trait;

use super::{Worker, WorkerError};
use crate::envelope::{SummaryType, WorkPayload, WorkResult};

/// Summary length used for `short` when no `max_length` is given.
pub const DEFAULT_SHORT_SUMMARY_CHARS: usize = 130;
/// Summary length used for `detailed` when no `max_length` is given.
pub const DEFAULT_DETAILED_SUMMARY_CHARS: usize = 400;

#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackWorker;

impl LoopbackWorker {
    pub fn new() -> Self {
        Self
    }
}

/// Leading whole words of `text` totalling at most `limit` characters.
fn truncate_words(text: &str, limit: usize) -> String {
    let mut out = String::new();
    let mut len = 0;
    for word in text.split_whitespace() {
        let word_len = word.chars().count();
        let needed = if out.is_empty() { word_len } else { word_len + 1 };
        if len + needed > limit {
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
        len += needed;
    }
    if out.is_empty() {
        // A single word longer than the limit is cut mid-word.
        out = text.trim().chars().take(limit).collect();
    }
    out
}

#[async_trait]
impl Worker for LoopbackWorker {
    async fn process(&self, payload: &WorkPayload) -> Result<WorkResult, WorkerError> {
        match payload {
            WorkPayload::Translation {
                text,
                source_language,
                target_language,
            } => Ok(WorkResult::Translation {
                translated_text: format!(
                    "[{}-{}] {}",
                    source_language.to_ascii_lowercase(),
                    target_language.to_ascii_lowercase(),
                    text
                ),
            }),
            WorkPayload::Summarization {
                text,
                summary_type,
                max_length,
            } => {
                let limit = max_length.map(|n| n as usize).unwrap_or(match summary_type {
                    SummaryType::Short => DEFAULT_SHORT_SUMMARY_CHARS,
                    SummaryType::Detailed => DEFAULT_DETAILED_SUMMARY_CHARS,
                });
                let summary = truncate_words(text, limit);
                Ok(WorkResult::Summarization {
                    original_length: text.chars().count(),
                    summary_length: summary.chars().count(),
                    summarized_text: summary,
                })
            }
        }
    }

    async fn health_check(&self) -> Result<(), WorkerError> {
        Ok(())
    }
}
