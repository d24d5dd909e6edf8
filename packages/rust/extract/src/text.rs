//! Normalization passes for text pulled out of PDFs.
//!
//! Each pass is a function `&str -> String` applied in sequence by
//! [`clean_text`].

use std::sync::LazyLock;

use regex::Regex;

/// Run every cleanup pass over raw extracted text.
pub fn clean_text(text: &str) -> String {
    let mut result = replace_nbsp(text);

    result = normalize_line_endings(&result);
    result = collapse_spaces(&result);
    result = collapse_blank_lines(&result);

    result.trim().to_string()
}

/// Split text into word tokens (runs of word characters).
pub fn tokenize(text: &str) -> Vec<&str> {
    static WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w+").expect("valid regex"));

    WORD_RE.find_iter(text).map(|m| m.as_str()).collect()
}

// ---------------------------------------------------------------------------
// Passes
// ---------------------------------------------------------------------------

fn replace_nbsp(text: &str) -> String {
    text.replace('\u{a0}', " ")
}

/// `\r\n` and lone `\r` become `\n`.
fn normalize_line_endings(text: &str) -> String {
    static EOL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\r\n|\r").expect("valid regex"));

    EOL_RE.replace_all(text, "\n").to_string()
}

/// Runs of spaces and tabs become one space.
fn collapse_spaces(text: &str) -> String {
    static SPACES_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[ \t]+").expect("valid regex"));

    SPACES_RE.replace_all(text, " ").to_string()
}

/// Collapse runs of 3+ newlines into exactly 2.
fn collapse_blank_lines(text: &str) -> String {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

    MULTI_BLANK_RE.replace_all(text, "\n\n").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_text_normalizes_whitespace() {
        let raw = "  Title\u{a0}here\r\n\r\n\r\n\r\nBody \t  text\rend  ";
        assert_eq!(clean_text(raw), "Title here\n\nBody text\nend");
    }

    #[test]
    fn clean_text_keeps_single_blank_line() {
        assert_eq!(clean_text("a\n\nb"), "a\n\nb");
    }

    #[test]
    fn clean_text_of_empty_is_empty() {
        assert_eq!(clean_text(""), "");
        assert_eq!(clean_text(" \n\n\n "), "");
    }

    #[test]
    fn tokenize_splits_on_punctuation() {
        assert_eq!(
            tokenize("Hello, world! It's 2024."),
            vec!["Hello", "world", "It", "s", "2024"]
        );
        assert!(tokenize("").is_empty());
    }
}
