//! src/filters.rs
//! Filtry słów per chat: lista wyzwalaczy trzymana w ustawieniach czatu,
//! dopasowanie po normalizacji (lowercase, bez whitespace, leet-fold).
//! Trafienie = kasujemy wiadomość; użytkownicy uprzywilejowani są zwolnieni
//! (o zwolnienie dba pipeline, nie ten moduł).

use once_cell::sync::Lazy;
use regex::Regex;

static RE_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?ix)\b((https?://|www\.)[^\s<>()]+|t\.me/[A-Za-z0-9_]+)\b"#).unwrap()
});

/// Blokada linków (gdy polityka czatu ma `block_links`).
pub fn contains_link(text: &str) -> bool {
    RE_LINK.is_match(text)
}

/// Zwraca pierwszy pasujący wyzwalacz albo None. Wyzwalacz przechodzi przez
/// tę samą normalizację co tekst – inaczej wielowyrazowe i leetowe wpisy
/// nigdy by nie trafiły.
pub fn match_trigger<'a>(triggers: &'a [String], text: &str) -> Option<&'a str> {
    if triggers.is_empty() {
        return None;
    }
    let folded = fold(text);
    triggers
        .iter()
        .map(|t| t.as_str())
        .find(|t| {
            let t = fold(t);
            !t.is_empty() && folded.contains(&t)
        })
}

fn fold(s: &str) -> String {
    leetspeak_fold(&strip_whitespace(&normalize_basic(s)))
}

fn normalize_basic(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .map(|c| match c {
            'ą' => 'a',
            'ć' => 'c',
            'ę' => 'e',
            'ł' => 'l',
            'ń' => 'n',
            'ó' => 'o',
            'ś' => 's',
            'ż' | 'ź' => 'z',
            _ => c,
        })
        .collect()
}

fn strip_whitespace(s: &str) -> String {
    s.replace(|c: char| c.is_whitespace(), "")
}

fn leetspeak_fold(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '0' => 'o',
            '1' | '!' => 'i',
            '3' => 'e',
            '4' | '@' => 'a',
            '5' | '$' => 's',
            '7' => 't',
            _ => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triggers(ts: &[&str]) -> Vec<String> {
        ts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn plain_match_is_case_insensitive() {
        let t = triggers(&["casino"]);
        assert_eq!(match_trigger(&t, "Best CASINO in town"), Some("casino"));
        assert_eq!(match_trigger(&t, "nothing here"), None);
    }

    #[test]
    fn leet_and_spacing_do_not_evade() {
        let t = triggers(&["casino"]);
        assert_eq!(match_trigger(&t, "c a s 1 n 0"), Some("casino"));
        assert_eq!(match_trigger(&t, "CA$INO!!"), Some("casino"));
    }

    #[test]
    fn link_detection_covers_bare_and_tme_links() {
        assert!(contains_link("join https://example.com/x now"));
        assert!(contains_link("see www.example.com"));
        assert!(contains_link("t.me/some_channel"));
        assert!(!contains_link("no links here"));
    }

    #[test]
    fn trigger_spelling_is_normalized_like_the_text() {
        // Wyzwalacz wielowyrazowy i leetowy – obie strony składamy tak samo.
        let t = triggers(&["free money"]);
        assert_eq!(match_trigger(&t, "FREE   money here"), Some("free money"));
        let t = triggers(&["cas1no"]);
        assert_eq!(match_trigger(&t, "best casino in town"), Some("cas1no"));
    }

    #[test]
    fn empty_trigger_list_matches_nothing() {
        assert_eq!(match_trigger(&[], "anything"), None);
        let t = triggers(&[""]);
        assert_eq!(match_trigger(&t, "anything"), None);
    }
}
