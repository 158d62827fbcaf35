//! Outbound line chunking (§4.4 "Outbound chunking").
//!
//! IRC limits each line to 512 bytes including CRLF. For each reply line we
//! compute a per-line payload budget and split on that budget; multi-line
//! replies are sent as independent `PRIVMSG`s.

/// RFC 2812's hard line limit, including the trailing CRLF.
pub const MAX_LINE_BYTES: usize = 512;

/// Compute the per-line payload budget for a `PRIVMSG` to `target`, given
/// the server's echoed full ident (`nick!ident@host`).
///
/// `510 - len(":<nick>!<ident>@<host> PRIVMSG <target> :")`, matching the
/// original implementation's `cb_handle_response`.
pub fn payload_budget(full_ident: &str, target: &str) -> usize {
    let overhead = format!("{full_ident}PRIVMSG {target} :").len();
    (MAX_LINE_BYTES - 2).saturating_sub(overhead)
}

/// Split `text` into IRC-safe chunks: split first on newlines (multi-line
/// replies are preserved as separate lines), then split each line on
/// `budget` bytes. Every chunk is at most `budget` bytes; the concatenation
/// of chunks equals the original text with line breaks preserved (testable
/// property 6).
pub fn chunk_message(text: &str, budget: usize) -> Vec<String> {
    if budget == 0 {
        return Vec::new();
    }
    let mut chunks = Vec::new();
    for line in text.split('\n') {
        if line.is_empty() {
            chunks.push(String::new());
            continue;
        }
        let bytes = line.as_bytes();
        let mut start = 0;
        while start < bytes.len() {
            let mut end = (start + budget).min(bytes.len());
            // Never split in the middle of a UTF-8 code point.
            while end > start && !line.is_char_boundary(end) {
                end -= 1;
            }
            chunks.push(line[start..end].to_string());
            start = end;
        }
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_message_is_a_single_chunk() {
        let chunks = chunk_message("hello", 100);
        assert_eq!(chunks, vec!["hello".to_string()]);
    }

    #[test]
    fn long_message_splits_on_budget() {
        let text = "a".repeat(25);
        let chunks = chunk_message(&text, 10);
        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            assert!(chunk.len() <= 10);
        }
        assert_eq!(chunks.concat(), text);
    }

    /// Testable property 6: every emitted line is within budget, and
    /// concatenation reconstructs the original with line breaks preserved.
    #[test]
    fn chunking_bound_and_reconstruction() {
        let text = format!("{}\n{}", "x".repeat(523), "short line");
        let budget = payload_budget(":nick!ident@host.example.org ", "#channel");
        let chunks = chunk_message(&text, budget);
        for chunk in &chunks {
            assert!(chunk.len() <= budget);
        }
        let rejoined = {
            // Reconstruct by tracking where original newlines were: since
            // chunk_message never merges across a '\n' boundary, splitting
            // chunks back on the original line structure recovers the text.
            let mut lines: Vec<String> = Vec::new();
            let mut current = String::new();
            for chunk in &chunks {
                current.push_str(chunk);
                if chunk.len() < budget {
                    lines.push(std::mem::take(&mut current));
                }
            }
            if !current.is_empty() {
                lines.push(current);
            }
            lines.join("\n")
        };
        assert_eq!(rejoined, text);
    }

    #[test]
    fn payload_budget_accounts_for_ident_overhead() {
        let short_ident_budget = payload_budget(":n!i@h ", "#c");
        let long_ident_budget = payload_budget(":n!i@a.very.long.hostname.example.org ", "#c");
        assert!(long_ident_budget < short_ident_budget);
    }
}
