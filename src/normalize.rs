//! Content normalization applied to message text before it reaches FTS5.
//!
//! The `unicode61` tokenizer does not split mixed-script runs, so
//! `"hello世界"` would be stored as one token. Normalization inserts a space
//! at every ASCII/non-ASCII alphanumeric boundary, folds ASCII case and
//! collapses whitespace.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CharClass {
    None,
    Space,
    Ascii,
    NonAscii,
    Other,
}

fn classify(c: char) -> CharClass {
    if c.is_whitespace() {
        CharClass::Space
    } else if c.is_ascii_alphanumeric() {
        CharClass::Ascii
    } else if c.is_alphanumeric() {
        CharClass::NonAscii
    } else {
        CharClass::Other
    }
}

/// Normalize message text for indexing.
///
/// Returns `input` unchanged when nothing but whitespace would remain.
pub fn normalize_content(input: &str) -> String {
    if input.is_empty() {
        return String::new();
    }

    let mut out = String::with_capacity(input.len() + 8);
    let mut prev = CharClass::None;
    let mut last_was_space = false;

    let push_space = |out: &mut String, last_was_space: &mut bool| {
        if !*last_was_space && !out.is_empty() {
            out.push(' ');
            *last_was_space = true;
        }
    };

    for c in input.chars() {
        let class = classify(c);
        match class {
            CharClass::Space => {
                push_space(&mut out, &mut last_was_space);
            }
            CharClass::Ascii => {
                if prev == CharClass::NonAscii {
                    push_space(&mut out, &mut last_was_space);
                }
                out.push(c.to_ascii_lowercase());
                last_was_space = false;
            }
            CharClass::NonAscii => {
                if prev == CharClass::Ascii {
                    push_space(&mut out, &mut last_was_space);
                }
                out.push(c);
                last_was_space = false;
            }
            CharClass::Other | CharClass::None => {
                out.push(c);
                last_was_space = false;
            }
        }
        prev = class;
    }

    let trimmed = out.trim();
    if trimmed.is_empty() {
        input.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_mixed_scripts() {
        assert_eq!(normalize_content("hello世界test"), "hello 世界 test");
        assert_eq!(normalize_content("版本v2发布"), "版本 v2 发布");
    }

    #[test]
    fn folds_ascii_case_only() {
        assert_eq!(normalize_content("Hello WORLD"), "hello world");
        assert_eq!(normalize_content("ÄÖÜ"), "ÄÖÜ");
    }

    #[test]
    fn collapses_whitespace_runs() {
        assert_eq!(normalize_content("  a \t\n\r  b  "), "a b");
        assert_eq!(normalize_content("第一行\n\n第二行"), "第一行 第二行");
    }

    #[test]
    fn punctuation_does_not_trigger_boundary_space() {
        assert_eq!(normalize_content("ok,好的"), "ok,好的");
        assert_eq!(normalize_content("see: https://x.io"), "see: https://x.io");
    }

    #[test]
    fn whitespace_only_input_is_returned_unchanged() {
        assert_eq!(normalize_content(""), "");
        assert_eq!(normalize_content(" \t\n"), " \t\n");
    }

    #[test]
    fn punctuation_only_input_is_kept() {
        assert_eq!(normalize_content("?!"), "?!");
    }
}
