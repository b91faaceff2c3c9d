use regex::Regex;

/// Canonical ticker form: trimmed, uppercased, optional leading `$` removed.
/// Returns `None` for anything that does not look like an exchange symbol
/// (1-5 letters with an optional `.X`/`-X` share-class suffix).
pub fn normalize_ticker(raw: &str) -> Option<String> {
    lazy_static::lazy_static! {
        static ref TICKER_RE: Regex = Regex::new(r"^[A-Z]{1,5}(?:[.\-][A-Z]{1,2})?$").unwrap();
    }

    let upper = raw.trim().trim_start_matches('$').to_uppercase();
    TICKER_RE.is_match(&upper).then_some(upper)
}

/// Collapses tabs/newlines/runs of spaces in free text.
pub fn normalize_thesis(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}
