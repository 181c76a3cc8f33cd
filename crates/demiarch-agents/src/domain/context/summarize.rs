//! Extractive summaries for the Index and Timeline layers

use super::error::{ContextError, ContextResult};

/// Produces the cheaper layers of a context item from its raw content
pub trait Summarizer: Send + Sync {
    /// One or two lines; the minimum retrievable unit
    fn index(&self, content: &str) -> ContextResult<String>;

    /// A short paragraph plus key points
    fn timeline(&self, content: &str) -> ContextResult<String>;
}

/// Sentence-compression summarizer, no model calls
#[derive(Debug, Clone)]
pub struct ExtractiveSummarizer {
    pub index_sentences: usize,
    pub timeline_sentences: usize,
    pub max_highlights: usize,
}

impl Default for ExtractiveSummarizer {
    fn default() -> Self {
        Self {
            index_sentences: 1,
            timeline_sentences: 4,
            max_highlights: 6,
        }
    }
}

impl Summarizer for ExtractiveSummarizer {
    fn index(&self, content: &str) -> ContextResult<String> {
        if content.trim().is_empty() {
            return Err(ContextError::invalid("cannot summarise empty content"));
        }

        let mut summary = compress_sentences(content, self.index_sentences);
        for highlight in extract_highlights(content, 2) {
            if summary.contains(&highlight) {
                continue;
            }
            summary.push_str(" | ");
            summary.push_str(&highlight);
        }
        Ok(summary)
    }

    fn timeline(&self, content: &str) -> ContextResult<String> {
        if content.trim().is_empty() {
            return Err(ContextError::invalid("cannot summarise empty content"));
        }

        let mut summary = compress_sentences(content, self.timeline_sentences);
        let highlights = extract_highlights(content, self.max_highlights);
        if !highlights.is_empty() {
            summary.push_str("\nKey points:");
            for highlight in highlights {
                summary.push_str("\n- ");
                summary.push_str(&highlight);
            }
        }
        Ok(summary)
    }
}

/// Compress a block of text down to at most `max_sentences` sentences
pub fn compress_sentences(content: &str, max_sentences: usize) -> String {
    if max_sentences == 0 {
        return String::new();
    }

    let mut out = String::new();
    let mut count = 0usize;

    for sentence in content.split(['.', '!', '?']) {
        let sentence = sentence.split_whitespace().collect::<Vec<_>>().join(" ");
        if sentence.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push_str(". ");
        }
        out.push_str(&sentence);
        count += 1;
        if count >= max_sentences {
            break;
        }
    }

    if !out.is_empty() && !out.ends_with(['.', '!', '?']) {
        out.push('.');
    }
    out
}

/// Bullet lines and the first sentence of longer lines, in order
pub fn extract_highlights(content: &str, max: usize) -> Vec<String> {
    let mut highlights: Vec<String> = Vec::new();
    for line in content.lines() {
        if highlights.len() >= max {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let candidate = if trimmed.starts_with(['-', '*', '•']) {
            trimmed.trim_start_matches(['-', '*', '•']).trim().to_string()
        } else if trimmed.len() > 12 {
            trimmed
                .split(['.', '!', '?'])
                .find(|s| !s.trim().is_empty())
                .unwrap_or(trimmed)
                .trim()
                .to_string()
        } else {
            continue;
        };

        if !candidate.is_empty() && !highlights.contains(&candidate) {
            highlights.push(candidate);
        }
    }
    highlights
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTES: &str = "We decided to use OAuth for login. Tokens live for one hour! \
        Refresh happens silently. Sessions are stored in SQLite.\n\
        - Use PKCE for the public client\n\
        - Rotate refresh tokens";

    #[test]
    fn test_compress_sentences() {
        assert_eq!(
            compress_sentences("First one. Second one! Third?", 2),
            "First one. Second one."
        );
        assert_eq!(compress_sentences("anything", 0), "");
    }

    #[test]
    fn test_highlights_prefer_bullets() {
        let highlights = extract_highlights(NOTES, 10);
        assert!(highlights.contains(&"Use PKCE for the public client".to_string()));
        assert!(highlights.contains(&"Rotate refresh tokens".to_string()));
    }

    #[test]
    fn test_index_is_shorter_than_timeline() {
        let summarizer = ExtractiveSummarizer::default();
        let index = summarizer.index(NOTES).unwrap();
        let timeline = summarizer.timeline(NOTES).unwrap();

        assert!(index.starts_with("We decided to use OAuth for login."));
        assert!(timeline.contains("Key points:"));
        assert!(index.len() < timeline.len());
    }

    #[test]
    fn test_empty_content_rejected() {
        let summarizer = ExtractiveSummarizer::default();
        assert!(summarizer.index("   ").is_err());
        assert!(summarizer.timeline("").is_err());
    }
}
