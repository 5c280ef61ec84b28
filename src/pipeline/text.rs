//! Context-text normalization shared by [`super::buffer::SmartBuffer`] and the whisper backend.

const KEEP_TOKENS: usize = 30;

/// Normalizes a finalized transcript into the form carried forward as `previous_context`:
/// Latin letters (including Latin-1 accented ranges), digits, `.,!?` and spaces only,
/// whitespace runs collapsed, and only the last [`KEEP_TOKENS`] tokens retained.
pub fn normalize_context(text: &str) -> String {
    let filtered: String = text
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | ',' | '!' | '?' | ' ') {
                c
            } else {
                ' '
            }
        })
        .collect();

    let tokens: Vec<&str> = filtered.split_whitespace().collect();
    let start = tokens.len().saturating_sub(KEEP_TOKENS);
    tokens[start..].join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_punctuation_outside_the_allowed_set() {
        let out = normalize_context("Hello -- world!! (really?) yes.");
        assert_eq!(out, "Hello world!! really? yes.");
    }

    #[test]
    fn collapses_whitespace_runs() {
        let out = normalize_context("a   b\t\tc\n\nd");
        assert_eq!(out, "a b c d");
    }

    #[test]
    fn keeps_only_the_last_thirty_tokens() {
        let words: Vec<String> = (0..50).map(|i| format!("w{i}")).collect();
        let input = words.join(" ");
        let out = normalize_context(&input);
        let kept: Vec<&str> = out.split(' ').collect();
        assert_eq!(kept.len(), 30);
        assert_eq!(kept[0], "w20");
        assert_eq!(kept[29], "w49");
    }

    #[test]
    fn keeps_accented_latin1_letters() {
        let out = normalize_context("café déjà vu");
        assert_eq!(out, "café déjà vu");
    }
}
