//! Filename sanitisation for saved images (§4.4 "Filename sanitisation").
//!
//! Grounded on `DreambotWorkerBase.clean_filename` / `FrontendIRC.clean_filename`
//! in the original implementation: NFKD-normalise, drop non-ASCII, restrict
//! to a whitelist, strip `__` pairs, truncate, append the suffix.

use unicode_normalization::UnicodeNormalization;

const WHITELIST_EXTRA: &[char] = &['_', '.', '(', ')', ' '];

fn is_whitelisted(c: char) -> bool {
    c.is_ascii_alphanumeric() || WHITELIST_EXTRA.contains(&c)
}

/// Core character-level sanitisation, with no length truncation and no
/// suffix appended. Idempotent: `sanitise_core(sanitise_core(s)) ==
/// sanitise_core(s)` (testable property 7), since every pass only removes
/// or merges characters, never introduces new ones outside the whitelist.
pub fn sanitise_core(raw: &str) -> String {
    // Spaces become underscores first, matching the original's `replace(' ', '_')`.
    let replaced: String = raw.chars().map(|c| if c == ' ' { '_' } else { c }).collect();

    // NFKD-normalise, then keep only ASCII.
    let ascii_only: String = replaced.nfkd().filter(|c| c.is_ascii()).collect();

    // Keep only whitelisted chars.
    let filtered: String = ascii_only.chars().filter(|c| is_whitelisted(*c)).collect();

    // Strip "__" pairs, matching the original's single left-to-right
    // non-overlapping `.replace("__", "")` pass: a run of underscores loses
    // pairs from the left, leaving one behind only if the run is odd-length.
    let mut collapsed = String::with_capacity(filtered.len());
    let mut run = 0usize;
    for c in filtered.chars() {
        if c == '_' {
            run += 1;
        } else {
            if run % 2 == 1 {
                collapsed.push('_');
            }
            run = 0;
            collapsed.push(c);
        }
    }
    if run % 2 == 1 {
        collapsed.push('_');
    }
    collapsed
}

/// Sanitise `raw` into a filesystem-safe base name, then append `suffix`
/// (e.g. `".png"`), keeping the whole result within `char_limit` bytes
/// including the suffix.
pub fn sanitise(raw: &str, char_limit: usize, suffix: &str) -> String {
    let budget = char_limit.saturating_sub(suffix.len());
    let core = sanitise_core(raw);
    let truncated: String = core.chars().take(budget).collect();
    format!("{truncated}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spaces_become_underscores() {
        let name = sanitise("a cat", 255, ".png");
        assert_eq!(name, "a_cat.png");
    }

    #[test]
    fn non_ascii_is_dropped() {
        let name = sanitise("caf\u{e9} time", 255, ".png");
        // "café" NFKD-decomposes to "cafe" + combining acute, which is
        // dropped by the ASCII filter, leaving "cafe".
        assert_eq!(name, "cafe_time.png");
    }

    #[test]
    fn double_space_is_deleted_not_collapsed() {
        // Two spaces become "__", which the original's `.replace("__", "")`
        // deletes outright rather than collapsing to a single "_".
        let name = sanitise("a  b", 255, ".png");
        assert_eq!(name, "ab.png");
    }

    #[test]
    fn disallowed_punctuation_is_dropped() {
        let name = sanitise("a/b;c*d", 255, ".png");
        assert_eq!(name, "abcd.png");
    }

    #[test]
    fn truncates_to_char_limit_minus_suffix() {
        let long = "x".repeat(300);
        let name = sanitise(&long, 255, ".png");
        assert_eq!(name.len(), 255);
        assert!(name.ends_with(".png"));
    }

    /// Testable property 7: idempotence, length bound, and whitelist
    /// conformance of the output.
    #[test]
    fn idempotent_length_bounded_and_whitelisted() {
        let inputs = ["a cat!! wearing/a;hat", "caf\u{e9}__double   spaces", "normal_name"];
        for input in inputs {
            let once = sanitise(input, 64, ".png");
            let twice = sanitise(&once, 64, ".png");
            assert_eq!(once, twice, "not idempotent for {input:?}");
            assert!(once.len() <= 64);
            let base = once.strip_suffix(".png").unwrap();
            assert!(base.chars().all(is_whitelisted), "bad chars in {once:?}");
        }
    }
}
