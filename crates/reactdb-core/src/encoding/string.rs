/// Terminates every encoded string. Sorts below every content character.
pub const STRING_TERMINATOR: char = '\u{0}';

const ESCAPE: char = '\u{1}';

/// Append `s` to `out` using the escaped-terminator scheme.
///
/// - `U+0000` becomes `U+0001 U+0001`
/// - `U+0001` becomes `U+0001 U+0002`
/// - every other character is copied as-is
///
/// followed by a single `U+0000` terminator. A shorter string therefore sorts
/// before any string it is a prefix of, and the terminator can never be
/// confused with content.
pub fn encode_string_into(s: &str, out: &mut String) {
    out.reserve(s.len() + 1);
    for c in s.chars() {
        match c {
            '\u{0}' => {
                out.push(ESCAPE);
                out.push('\u{1}');
            }
            '\u{1}' => {
                out.push(ESCAPE);
                out.push('\u{2}');
            }
            other => out.push(other),
        }
    }
    out.push(STRING_TERMINATOR);
}

pub fn encode_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 1);
    encode_string_into(s, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escaping() {
        assert_eq!(encode_string("ab"), "ab\u{0}");
        assert_eq!(encode_string("a\u{0}b"), "a\u{1}\u{1}b\u{0}");
        assert_eq!(encode_string("\u{1}"), "\u{1}\u{2}\u{0}");
    }

    #[test]
    fn test_ordering_preserved() {
        let mut values = vec![
            "", "\u{0}", "\u{0}\u{0}", "\u{1}", "\u{2}", "a", "a\u{0}", "a\u{1}", "aa", "ab", "b",
            "\u{1F600}",
        ];
        values.sort();
        let encoded: Vec<String> = values.iter().map(|s| encode_string(s)).collect();
        for i in 0..encoded.len() - 1 {
            assert!(
                encoded[i] < encoded[i + 1],
                "expected {:?} < {:?}",
                values[i],
                values[i + 1]
            );
        }
    }

    #[test]
    fn test_prefix_sorts_first() {
        assert!(encode_string("user") < encode_string("user1"));
        assert!(encode_string("user") < encode_string("user\u{0}"));
    }
}
