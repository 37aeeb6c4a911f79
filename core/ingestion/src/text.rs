use std::collections::HashSet;

const STOPWORDS: &[&str] = &[
    "the", "and", "that", "this", "with", "from", "have", "would", "there", "could", "should",
    "about", "after", "before", "while", "since", "where", "which", "into", "using", "also",
    "because", "these", "those", "been", "being", "were", "does", "done", "make", "made", "when",
    "then", "than", "your", "their", "them", "they", "what", "ever", "over", "just", "more",
    "only", "each", "such", "very", "much", "like", "onto", "upon", "for", "was", "are", "its",
    "our", "per", "how", "who", "why",
];

/// Lowercased alphanumeric tokens, stopwords removed.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '.')
        .map(|t| t.trim_matches('.'))
        .filter(|t| t.len() >= 2 && !STOPWORDS.contains(t))
        .map(|t| t.to_string())
        .collect()
}

/// Normalized name used for entity lookups: lowercase, single-spaced, no punctuation.
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build a safe FTS5 MATCH expression (quoted OR-ed tokens).
/// Returns `None` when the text has no searchable tokens.
pub fn fts_match_expression(text: &str) -> Option<String> {
    let mut seen = HashSet::new();
    let terms: Vec<String> = tokenize(text)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .map(|t| format!("\"{}\"", t.replace('"', "")))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

/// Jaccard similarity of token sets.
pub fn jaccard_similarity(text1: &str, text2: &str) -> f32 {
    let words1: HashSet<String> = tokenize(text1).into_iter().collect();
    let words2: HashSet<String> = tokenize(text2).into_iter().collect();

    if words1.is_empty() && words2.is_empty() {
        return 0.0;
    }

    let intersection = words1.intersection(&words2).count();
    let union = words1.union(&words2).count();

    if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    }
}

/// Character-bigram Dice coefficient; tolerant of short names and typos.
pub fn bigram_similarity(a: &str, b: &str) -> f32 {
    let a = normalize_name(a);
    let b = normalize_name(b);
    if a == b {
        return 1.0;
    }

    let bigrams = |s: &str| -> Vec<(char, char)> {
        let chars: Vec<char> = s.chars().filter(|c| !c.is_whitespace()).collect();
        chars.windows(2).map(|w| (w[0], w[1])).collect()
    };

    let ab = bigrams(&a);
    let mut bb = bigrams(&b);
    if ab.is_empty() || bb.is_empty() {
        return 0.0;
    }

    let total = ab.len() + bb.len();
    let mut shared = 0;
    for pair in &ab {
        if let Some(pos) = bb.iter().position(|p| p == pair) {
            bb.swap_remove(pos);
            shared += 1;
        }
    }

    (2 * shared) as f32 / total as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_drops_stopwords_and_punctuation() {
        assert_eq!(
            tokenize("What was the Q3 revenue?"),
            vec!["q3".to_string(), "revenue".to_string()]
        );
        assert_eq!(tokenize("revenue = 5.2M"), vec!["revenue", "5.2m"]);
    }

    #[test]
    fn test_fts_expression_is_quoted() {
        assert_eq!(
            fts_match_expression("Q3 revenue, revenue!").as_deref(),
            Some("\"q3\" OR \"revenue\"")
        );
        assert!(fts_match_expression("the and ?").is_none());
    }

    #[test]
    fn test_similarity_measures() {
        assert!((jaccard_similarity("gross margin", "gross margin") - 1.0).abs() < 1e-6);
        assert_eq!(jaccard_similarity("revenue", "headcount"), 0.0);
        assert!(bigram_similarity("Acme Corp", "ACME Corp.") > 0.99);
        assert!(bigram_similarity("Acme Corporation", "Acme Corp") > 0.6);
        assert!(bigram_similarity("Acme", "Globex") < 0.2);
    }
}
