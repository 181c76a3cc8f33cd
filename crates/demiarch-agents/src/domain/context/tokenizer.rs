//! Token counting shared by the store and the retriever

/// Counts tokens the same way everywhere a budget is enforced
pub trait Tokenizer: Send + Sync {
    fn count(&self, text: &str) -> usize;

    /// Longest prefix of `text` that fits in `max_tokens`, cut on a char boundary
    fn truncate<'a>(&self, text: &'a str, max_tokens: usize) -> &'a str {
        if self.count(text) <= max_tokens {
            return text;
        }
        let bounds: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        let (mut lo, mut hi) = (0usize, bounds.len());
        while lo < hi {
            let mid = (lo + hi).div_ceil(2);
            if self.count(&text[..bounds[mid - 1] + char_len(text, bounds[mid - 1])]) <= max_tokens {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        match lo {
            0 => "",
            n => &text[..bounds[n - 1] + char_len(text, bounds[n - 1])],
        }
    }
}

fn char_len(text: &str, at: usize) -> usize {
    text[at..].chars().next().map_or(0, char::len_utf8)
}

/// Roughly four characters per token, rounded up
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenizer;

impl Tokenizer for HeuristicTokenizer {
    fn count(&self, text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }

    fn truncate<'a>(&self, text: &'a str, max_tokens: usize) -> &'a str {
        let max_chars = max_tokens.saturating_mul(4);
        match text.char_indices().nth(max_chars) {
            Some((cut, _)) => &text[..cut],
            None => text,
        }
    }
}
