//! Tokenization shared by index builds and queries.
//!
//! Lowercases, splits on anything that is neither alphanumeric nor `_`, and
//! drops single-character tokens and common English stop words. Identifiers
//! such as `snake_case_name` survive as one token.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

static STOP_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is", "it",
        "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there", "these",
        "they", "this", "to", "was", "will", "with",
    ]
    .into_iter()
    .collect()
});

fn is_token_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn keep(token: &str) -> bool {
    token.chars().count() > 1 && !STOP_WORDS.contains(token)
}

pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !is_token_char(c))
        .filter(|t| keep(t))
        .map(str::to_string)
        .collect()
}

/// Distinct query terms in first-seen order.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(query)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

pub fn term_frequencies(tokens: &[String]) -> HashMap<String, u32> {
    let mut tf: HashMap<String, u32> = HashMap::new();
    for token in tokens {
        *tf.entry(token.clone()).or_insert(0) += 1;
    }
    tf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_lowercases_and_drops_stop_words() {
        let tokens = tokenize("The Quick brown-fox, and the lazy_dog!");
        assert_eq!(tokens, vec!["quick", "brown", "fox", "lazy_dog"]);
    }

    #[test]
    fn single_characters_are_dropped() {
        assert_eq!(tokenize("a b c go"), vec!["go"]);
    }

    #[test]
    fn query_terms_are_distinct() {
        assert_eq!(query_terms("foo Foo bar foo"), vec!["foo", "bar"]);
        assert!(query_terms("  ").is_empty());
    }

    #[test]
    fn frequencies_count_repeats() {
        let tf = term_frequencies(&tokenize("foo bar foo"));
        assert_eq!(tf["foo"], 2);
        assert_eq!(tf["bar"], 1);
    }
}
