//! Built-in text statistics capability
//!
//! Stands in for the NLP layer when the worker is run on plain text: every
//! input line becomes one [`TextStats`] record.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use kgflow_runtime::{ConfigError, ProcessingError, Processor};

/// One line of input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// 1-based position in the input stream
    pub number: u64,
    pub text: String,
}

/// Statistics computed for one line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextStats {
    pub line: u64,
    pub chars: usize,
    pub words: usize,
    pub sentences: usize,
    /// First longest word, if the line has any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longest_word: Option<String>,
}

/// Computes [`TextStats`] for each line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextStatsProcessor {
    max_chars: usize,
}

impl Default for TextStatsProcessor {
    fn default() -> Self {
        Self { max_chars: 10_000 }
    }
}

impl TextStatsProcessor {
    /// Lines longer than `max_chars` characters are rejected
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }

    /// Read `KGFLOW_MAX_LINE_CHARS`
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var("KGFLOW_MAX_LINE_CHARS") {
            Err(_) => Ok(Self::default()),
            Ok(raw) => raw
                .trim()
                .parse()
                .map(Self::new)
                .map_err(|_| ConfigError::Env {
                    key: "KGFLOW_MAX_LINE_CHARS".to_string(),
                    value: raw,
                }),
        }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    fn stats(&self, line: &Line) -> TextStats {
        let text = line.text.trim();
        let words: Vec<&str> = text
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
            .filter(|w| !w.is_empty())
            .collect();

        let terminators = text
            .split(['.', '!', '?'])
            .filter(|s| !s.trim().is_empty())
            .count();

        let longest_word = words
            .iter()
            .fold(None::<&str>, |best, w| match best {
                Some(b) if b.chars().count() >= w.chars().count() => Some(b),
                _ => Some(w),
            })
            .map(str::to_string);

        TextStats {
            line: line.number,
            chars: text.chars().count(),
            words: words.len(),
            sentences: terminators,
            longest_word,
        }
    }
}

#[async_trait]
impl Processor for TextStatsProcessor {
    type Task = Line;
    type Output = TextStats;

    fn name(&self) -> &str {
        "text-stats"
    }

    async fn validate(&self) -> bool {
        self.max_chars > 0
    }

    async fn process(&self, task: Line) -> Result<TextStats, ProcessingError> {
        let chars = task.text.chars().count();
        if chars > self.max_chars {
            return Err(ProcessingError::new(format!(
                "line {} has {} characters, limit is {}",
                task.number, chars, self.max_chars
            )));
        }
        Ok(self.stats(&task))
    }
}
