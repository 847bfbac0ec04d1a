//! Optional one-line topic summaries stored next to each embedding.

use topicsync_shared::Result;

/// What a summarizer sees for one topic.
#[derive(Debug, Clone, Copy)]
pub struct SummaryInput<'a> {
    pub title: &'a str,
    pub code: &'a str,
    pub level: u8,
    /// Ancestor titles, root first.
    pub path: &'a [String],
    pub subject_label: &'a str,
}

/// Produces a short natural-language summary for a topic.
#[allow(async_fn_in_trait)]
pub trait Summarizer {
    async fn summarize(&self, input: SummaryInput<'_>) -> Result<String>;
}

/// Deterministic summarizer built from the topic's position in the tree.
#[derive(Debug, Clone)]
pub struct PathSummarizer {
    max_chars: usize,
}

impl PathSummarizer {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

impl Summarizer for PathSummarizer {
    async fn summarize(&self, input: SummaryInput<'_>) -> Result<String> {
        let text = match input.path {
            [] => format!("{} is a top-level topic in {}.", input.title, input.subject_label),
            path => format!(
                "{} is covered under {} in {}.",
                input.title,
                path.join(" > "),
                input.subject_label
            ),
        };
        Ok(truncate_chars(&text, self.max_chars))
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    if let Some(cut) = out.rfind(char::is_whitespace) {
        out.truncate(cut);
    }
    out.push('…');
    out
}
