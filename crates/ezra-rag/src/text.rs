//! Normalization and tokenization for Hebrew/English support content.
//!
//! All passage bodies and queries pass through `normalize` before they touch
//! the indexes, so the sparse statistics, the reranker and the confidence
//! gate all see the same canonical text.

use std::sync::LazyLock;

use regex::Regex;

/// Word tokens: Hebrew letters, Latin letters, digits and apostrophes.
static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\u{0590}-\u{05FF}a-zA-Z0-9']+").expect("token regex is valid")
});

/// Prefix for character-trigram shadow tokens. Contains a non-word character
/// so shadow tokens can never collide with real word tokens.
const TRIGRAM_PREFIX: &str = "§3:";

/// Common Hebrew function words excluded from salient-term extraction.
const HEBREW_STOPWORDS: &[&str] = &[
    "של", "עם", "גם", "אם", "על", "זה", "או", "כל", "לא", "כן", "יש", "אין",
    "מה", "איך", "אני", "אתה", "את", "אנחנו", "הם", "הן", "להיות", "היה",
    "היו", "מאוד", "יותר", "פחות", "שלך", "שלכם", "שלכן", "למה", "כדי", "כי",
    "האם", "יכול", "יכולה", "אפשר", "צריך", "צריכה", "תודה",
];

/// Remove HTML tags while preserving spacing, decoding the handful of
/// entities that show up in scraped support articles.
pub fn strip_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '<' => {
                in_tag = true;
                out.push(' ');
            }
            '>' if in_tag => in_tag = false,
            '&' if !in_tag => {
                // Collect a short entity name; fall back to the literal '&'.
                let mut entity = String::new();
                let mut terminated = false;
                while let Some(&next) = chars.peek() {
                    if next == ';' {
                        chars.next();
                        terminated = true;
                        break;
                    }
                    if !next.is_ascii_alphanumeric() && next != '#' || entity.len() > 6 {
                        break;
                    }
                    entity.push(next);
                    chars.next();
                }
                if terminated {
                    match entity.as_str() {
                        "nbsp" => out.push('\u{a0}'),
                        "amp" => out.push('&'),
                        "lt" => out.push('<'),
                        "gt" => out.push('>'),
                        "quot" => out.push('"'),
                        "apos" | "#39" => out.push('\''),
                        _ => {
                            out.push('&');
                            out.push_str(&entity);
                            out.push(';');
                        }
                    }
                } else {
                    out.push('&');
                    out.push_str(&entity);
                }
            }
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }

    out
}

/// Standardize punctuation, spaces and stray markup in support passages.
///
/// Strips HTML, maps typographic quote variants to ASCII, removes no-break
/// spaces and bidirectional control marks, and collapses whitespace runs.
/// Idempotent on its own output, with one documented boundary: markup that
/// arrives entity-encoded (`&lt;b&gt;`) decodes to literal markup on the
/// first pass, so a second pass would strip it as a tag. Callers normalize
/// exactly once per text.
pub fn normalize(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let stripped = strip_html(text);
    let mut cleaned = String::with_capacity(stripped.len());
    for ch in stripped.chars() {
        match ch {
            '\u{201c}' | '\u{201d}' | '\u{201e}' | '\u{201f}' => cleaned.push('"'),
            '\u{2019}' | '\u{201a}' | '\u{2018}' | '\u{201b}' => cleaned.push('\''),
            '\u{a0}' => cleaned.push(' '),
            '\u{200f}' => {}
            '\u{202a}'..='\u{202e}' => {}
            _ => cleaned.push(ch),
        }
    }

    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Tokenize normalized Hebrew/English text for retrieval: normalize,
/// lowercase, split on the word-character pattern.
pub fn tokenize(text: &str) -> Vec<String> {
    let normalized = normalize(text).to_lowercase();
    TOKEN_RE
        .find_iter(&normalized)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Tokenize for the sparse index: word tokens plus character-trigram shadow
/// tokens for Hebrew words. The trigrams give partial credit for
/// morphological variants, since no Hebrew stemmer is in the loop.
pub fn tokenize_for_index(text: &str) -> Vec<String> {
    let mut tokens = tokenize(text);
    let mut shadows = Vec::new();
    for token in &tokens {
        if token.chars().any(is_hebrew) {
            let chars: Vec<char> = token.chars().collect();
            for window in chars.windows(3) {
                let gram: String = window.iter().collect();
                shadows.push(format!("{TRIGRAM_PREFIX}{gram}"));
            }
        }
    }
    tokens.extend(shadows);
    tokens
}

/// True for word tokens, false for trigram shadow tokens.
pub fn is_word_token(token: &str) -> bool {
    !token.starts_with(TRIGRAM_PREFIX)
}

fn is_hebrew(ch: char) -> bool {
    ('\u{0590}'..='\u{05FF}').contains(&ch)
}

/// Select up to `max_terms` salient tokens: stopwords removed, short tokens
/// removed, duplicates removed, original order preserved.
pub fn key_terms(tokens: &[String], max_terms: usize) -> Vec<String> {
    let mut selected: Vec<String> = Vec::new();
    for token in tokens {
        if !is_word_token(token) {
            continue;
        }
        if HEBREW_STOPWORDS.contains(&token.as_str()) {
            continue;
        }
        if token.chars().count() < 3 {
            continue;
        }
        if selected.iter().any(|t| t == token) {
            continue;
        }
        selected.push(token.clone());
        if selected.len() >= max_terms {
            break;
        }
    }
    selected
}

/// Consistent textual representation of a knowledge passage, used for
/// embedding and reranker input.
pub fn passage_representation(url: &str, question: Option<&str>, answer: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    let url = normalize(url);
    if !url.is_empty() {
        parts.push(format!("כתובת: {url}"));
    }
    if let Some(question) = question {
        let question = normalize(question);
        if !question.is_empty() {
            parts.push(format!("שאלה: {question}"));
        }
    }
    let answer = normalize(answer);
    if !answer.is_empty() {
        parts.push(format!("תשובה: {answer}"));
    }
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_html_and_quotes() {
        let raw = "<p>לחצו\u{a0}על “הגדרות”&nbsp;ואז ‘שמירה’</p>";
        let cleaned = normalize(raw);
        assert_eq!(cleaned, "לחצו על \"הגדרות\" ואז 'שמירה'");
    }

    #[test]
    fn normalize_removes_directional_marks() {
        let raw = "שלום\u{200f} \u{202b}עולם\u{202c}";
        assert_eq!(normalize(raw), "שלום עולם");
    }

    #[test]
    fn normalize_is_idempotent() {
        let samples = [
            "",
            "  plain   text  ",
            "<div>nested <b>tags</b> &amp; entities</div>",
            "“double” and ‘single’ quotes",
            "עברית\u{a0}עם רווחים\u{200f}",
            "mixed עברית and english 123",
        ];
        for sample in samples {
            let once = normalize(sample);
            assert_eq!(normalize(&once), once, "not idempotent for {sample:?}");
        }
    }

    #[test]
    fn entity_encoded_markup_decodes_to_literal_markup() {
        // The decoded form is itself markup, so re-normalizing would
        // strip it; idempotency holds only from the first output onward.
        assert_eq!(normalize("&lt;b&gt;bold&lt;/b&gt;"), "<b>bold</b>");
    }

    #[test]
    fn normalize_empty_input_is_empty() {
        assert_eq!(normalize(""), "");
        assert_eq!(tokenize(""), Vec::<String>::new());
    }

    #[test]
    fn tokenize_mixes_scripts_and_lowercases() {
        let tokens = tokenize("How do I reset מערכת ZebraCRM's password?");
        assert_eq!(
            tokens,
            vec!["how", "do", "i", "reset", "מערכת", "zebracrm's", "password"]
        );
    }

    #[test]
    fn index_tokens_include_hebrew_trigrams() {
        let tokens = tokenize_for_index("משימות");
        assert!(tokens.contains(&"משימות".to_string()));
        assert!(tokens.contains(&format!("{TRIGRAM_PREFIX}משי")));
        assert!(tokens.contains(&format!("{TRIGRAM_PREFIX}ימו")));
        // English tokens get no shadows.
        let english = tokenize_for_index("password reset");
        assert!(english.iter().all(|t| is_word_token(t)));
    }

    #[test]
    fn key_terms_filters_stopwords_and_short_tokens() {
        let tokens = tokenize("איך אני יכול לערוך משימה של לקוח");
        let terms = key_terms(&tokens, 3);
        assert_eq!(terms, vec!["לערוך", "משימה", "לקוח"]);
    }

    #[test]
    fn key_terms_deduplicates() {
        let tokens = tokenize("reset password reset password");
        assert_eq!(key_terms(&tokens, 5), vec!["reset", "password"]);
    }

    #[test]
    fn passage_representation_orders_fields() {
        let text = passage_representation(
            "https://support.example.com/a",
            Some("איך עורכים משימה?"),
            "לחיצה על עריכת משימה",
        );
        assert_eq!(
            text,
            "כתובת: https://support.example.com/a\nשאלה: איך עורכים משימה?\nתשובה: לחיצה על עריכת משימה"
        );
    }
}
