//! Title normalization for identity matching.
//!
//! Two titles that differ only in case, whitespace, leading bullet markers,
//! diacritics, or typographic punctuation normalize to the same key.

use std::sync::LazyLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// Leading list markers: bullets, dashes, arrows, and runs of them.
static LEADING_BULLET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\s\-\*\+•·‣◦▪▫●○■□►▶→–—]+").expect("bullet regex")
});

/// Normalize a topic title into its matching key.
pub fn normalize_title(title: &str) -> String {
    let folded: String = title
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .map(fold_punctuation)
        .collect();

    let stripped = LEADING_BULLET_RE.replace(&folded, "");

    stripped
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Map typographic punctuation to its ASCII equivalent.
fn fold_punctuation(c: char) -> char {
    match c {
        '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{2032}' | '`' => '\'',
        '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{2033}' => '"',
        '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2014}' | '\u{2212}' => '-',
        '\u{00A0}' | '\u{2007}' | '\u{202F}' => ' ',
        other => other,
    }
}
