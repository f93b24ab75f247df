use std::borrow::Cow;

use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

/// Unicode replacement character, emitted by lossy decoders for invalid bytes.
const REPLACEMENT_CHAR: char = '\u{FFFD}';

/// Ellipsis appended by [`truncate_to_width`] when text is cut.
const ELLIPSIS: &str = "...";
const ELLIPSIS_WIDTH: usize = 3;

/// Cleans one character-data fragment from the feed tokenizer.
///
/// Trims surrounding whitespace and removes every U+FFFD. Returns
/// `Cow::Borrowed` when nothing had to be removed from the interior.
///
/// ```
/// use kiosk::util::clean_fragment;
///
/// assert_eq!(clean_fragment("  Hello\n"), "Hello");
/// assert_eq!(clean_fragment("Caf\u{FFFD}e"), "Cafe");
/// assert_eq!(clean_fragment(" \t "), "");
/// ```
pub fn clean_fragment(fragment: &str) -> Cow<'_, str> {
    let trimmed = fragment.trim();
    if trimmed.contains(REPLACEMENT_CHAR) {
        Cow::Owned(trimmed.replace(REPLACEMENT_CHAR, ""))
    } else {
        Cow::Borrowed(trimmed)
    }
}

/// Case-insensitive substring test.
///
/// `needle_lower` must already be lowercased; callers filtering many
/// haystacks against one query lowercase it once.
pub fn contains_ignore_case(haystack: &str, needle_lower: &str) -> bool {
    if needle_lower.is_empty() {
        return true;
    }
    // Fast path: ASCII haystacks avoid the allocation in to_lowercase()
    if haystack.is_ascii() && needle_lower.is_ascii() {
        return haystack
            .as_bytes()
            .windows(needle_lower.len())
            .any(|w| w.eq_ignore_ascii_case(needle_lower.as_bytes()));
    }
    haystack.to_lowercase().contains(needle_lower)
}

/// Display width of a string in terminal columns.
pub fn display_width(s: &str) -> usize {
    UnicodeWidthStr::width(s)
}

/// Truncates `s` to at most `max_width` terminal columns.
///
/// Appends "..." when text is cut and there is room for it. Wide (CJK,
/// emoji) characters count as two columns.
///
/// ```
/// use kiosk::util::truncate_to_width;
///
/// assert_eq!(truncate_to_width("Short", 10), "Short");
/// assert_eq!(truncate_to_width("Hello World", 8), "Hello...");
/// assert_eq!(truncate_to_width("Test", 2), "Te");
/// ```
pub fn truncate_to_width(s: &str, max_width: usize) -> Cow<'_, str> {
    if display_width(s) <= max_width {
        return Cow::Borrowed(s);
    }

    let (budget, suffix) = if max_width > ELLIPSIS_WIDTH {
        (max_width - ELLIPSIS_WIDTH, ELLIPSIS)
    } else {
        (max_width, "")
    };

    let mut used = 0;
    let mut cut = 0;
    for (idx, c) in s.char_indices() {
        let w = UnicodeWidthChar::width(c).unwrap_or(0);
        if used + w > budget {
            break;
        }
        used += w;
        cut = idx + c.len_utf8();
    }

    Cow::Owned(format!("{}{}", &s[..cut], suffix))
}

/// SEC-001: Strip terminal control characters and ANSI escape sequences.
///
/// Feed text is attacker-controlled and is printed straight to the terminal
/// by the CLI. Tab, newline and carriage return are kept. CSI (`ESC [`) and
/// OSC (`ESC ]`) sequences are removed in full.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    let is_unsafe = |c: char| c == '\x1b' || c == '\x7f' || (c < ' ' && !matches!(c, '\t' | '\n' | '\r'));

    if !s.chars().any(is_unsafe) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            match chars.peek() {
                Some('[') => {
                    chars.next();
                    // Parameter bytes run until a final byte in 0x40..=0x7E
                    for c in chars.by_ref() {
                        if ('\x40'..='\x7e').contains(&c) {
                            break;
                        }
                    }
                }
                Some(']') => {
                    chars.next();
                    // OSC runs until BEL or ST (ESC \)
                    while let Some(c) = chars.next() {
                        if c == '\x07' {
                            break;
                        }
                        if c == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {}
            }
        } else if !is_unsafe(c) {
            out.push(c);
        }
    }

    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_fragment_trims_and_strips_replacement() {
        assert_eq!(clean_fragment("\n   Title  \n"), "Title");
        assert_eq!(clean_fragment("\u{FFFD}News\u{FFFD}"), "News");
        assert_eq!(clean_fragment("a \u{FFFD} b"), "a  b");
    }

    #[test]
    fn test_clean_fragment_borrows_when_clean() {
        assert!(matches!(clean_fragment("  plain "), Cow::Borrowed("plain")));
    }

    #[test]
    fn test_contains_ignore_case_ascii() {
        assert!(contains_ignore_case("Rust Weekly", "weekly"));
        assert!(contains_ignore_case("RUST", "rust"));
        assert!(!contains_ignore_case("Rust", "rusty"));
    }

    #[test]
    fn test_contains_ignore_case_unicode() {
        assert!(contains_ignore_case("Über Straße", "über"));
        assert!(!contains_ignore_case("Über", "unter"));
    }

    #[test]
    fn test_contains_ignore_case_empty_needle() {
        assert!(contains_ignore_case("", ""));
        assert!(contains_ignore_case("anything", ""));
    }

    #[test]
    fn test_truncate_ascii() {
        assert_eq!(truncate_to_width("Hello World", 8), "Hello...");
        assert_eq!(truncate_to_width("Hello", 5), "Hello");
    }

    #[test]
    fn test_truncate_cjk() {
        // 8 columns, budget 4 after ellipsis
        assert_eq!(truncate_to_width("你好世界", 7), "你好...");
    }

    #[test]
    fn test_truncate_narrow_widths() {
        assert_eq!(truncate_to_width("Test", 0), "");
        assert_eq!(truncate_to_width("Test", 1), "T");
        assert_eq!(truncate_to_width("Test", 3), "Tes");
    }

    #[test]
    fn test_strip_control_chars_clean_input_borrowed() {
        assert!(matches!(strip_control_chars("ok\ttext\n"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_strip_csi_and_osc() {
        assert_eq!(strip_control_chars("\x1b[31mred\x1b[0m"), "red");
        assert_eq!(strip_control_chars("\x1b]0;title\x07after"), "after");
        assert_eq!(strip_control_chars("\x1b]8;;x\x1b\\link"), "link");
    }

    #[test]
    fn test_strip_bare_controls() {
        assert_eq!(strip_control_chars("a\x00b\x7fc\x1bd"), "abcd");
    }
}
