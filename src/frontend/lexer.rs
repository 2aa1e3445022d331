//! Turns a source file into a flat token stream.
//!
//! Tokens are whitespace-separated. `#` starts a line comment. String and
//! char literals keep their surrounding quotes in the token text and are
//! decoded later (interning pass, IR builder). Classification order: exact
//! keyword match first, then integer literals, then `&`-prefixed address-of
//! tokens, and everything else is a word.

use crate::{
    frontend::{Keyword, Location, Token, TokenKind},
    report::{CResult, Reporter},
};

pub fn lex(
    reporter: &Reporter,
    contents: &str,
    path: &'static str,
    tokens: &mut Vec<Token>,
) -> CResult<()> {
    let bytes = contents.as_bytes();
    let mut line: u32 = 1;
    let mut column: u32 = 1;
    let mut i = 0;

    while i < bytes.len() {
        // Skip whitespace and `#` comments, tracking the position.
        loop {
            let mut skipped = false;

            while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                skipped = true;
                if bytes[i] == b'\n' {
                    line += 1;
                    column = 1;
                } else {
                    column += 1;
                }
                i += 1;
            }

            if i < bytes.len() && bytes[i] == b'#' {
                skipped = true;
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }

            if !skipped {
                break;
            }
        }

        if i >= bytes.len() {
            break;
        }

        let location = Location::new(path, line, column);
        let byte = bytes[i];

        let token = if byte == b'"' || byte == b'\'' {
            read_quoted(reporter, contents, i, location)?
        } else {
            let end = contents[i..]
                .find(|c: char| c.is_ascii_whitespace())
                .map(|offset| i + offset)
                .unwrap_or(contents.len());
            classify_word(&contents[i..end], location)
        };

        i += token.text.len();
        column += token.text.len() as u32;
        tokens.push(token);
    }

    Ok(())
}

/// Reads a string or char literal including both quotes. The terminator scan
/// looks for the first closing quote that is not preceded by a backslash.
fn read_quoted(
    reporter: &Reporter,
    contents: &str,
    start: usize,
    location: Location,
) -> CResult<Token> {
    let bytes = contents.as_bytes();
    let quote = bytes[start];
    let kind = if quote == b'"' {
        TokenKind::Str { id: None }
    } else {
        TokenKind::Char
    };

    if start + 1 >= bytes.len() {
        return Err(reporter.fatal_at(
            location,
            format!("missing terminating `{}` character", quote as char),
        ));
    }

    if bytes[start + 1] == quote {
        if quote == b'\'' {
            return Err(reporter.fatal_at(location, "empty character literals are invalid"));
        }
        return Ok(Token::new(location, "\"\"", kind));
    }

    let mut end = None;
    for j in start + 2..bytes.len() {
        if bytes[j] == quote && bytes[j - 1] != b'\\' {
            end = Some(j);
            break;
        }
    }

    match end {
        Some(end) => Ok(Token::new(location, &contents[start..=end], kind)),
        None => Err(reporter.fatal_at(
            location,
            format!("missing terminating `{}` character", quote as char),
        )),
    }
}

fn classify_word(text: &str, location: Location) -> Token {
    if let Ok(keyword) = text.parse::<Keyword>() {
        return Token::new(location, text, TokenKind::Keyword(keyword));
    }

    if let Some((value, width)) = parse_integer(text) {
        return Token::new(location, text, TokenKind::Integer { value, width });
    }

    if text.starts_with('&') {
        return Token::new(location, text, TokenKind::AddressOf);
    }

    Token::new(location, text, TokenKind::Word)
}

/// Integer literals: optional base prefix (`0b` 2, `0s` 6, `0o` 8, `0x` 16,
/// none 10), `_` separators, and an optional `[iu](8|16|32|64)` width
/// suffix. A digit outside the base makes the whole token a word instead.
fn parse_integer(text: &str) -> Option<(u64, Option<u8>)> {
    let bytes = text.as_bytes();

    let (base, digits) = if bytes.len() > 2 && bytes[0] == b'0' {
        match bytes[1] {
            b'b' => (2, &text[2..]),
            b's' => (6, &text[2..]),
            b'o' => (8, &text[2..]),
            b'x' => (16, &text[2..]),
            _ => (10, text),
        }
    } else {
        (10, text)
    };

    let digits = digits.trim_start_matches(['0', '_']);
    let (digits, width) = split_width_suffix(digits)?;

    let mut value: u64 = 0;
    for &byte in digits.as_bytes() {
        if byte == b'_' {
            continue;
        }

        let digit = match byte {
            b'0'..=b'9' => (byte - b'0') as u64,
            b'a'..=b'z' => (byte - b'a' + 10) as u64,
            b'A'..=b'Z' => (byte - b'A' + 10) as u64,
            _ => return None,
        };

        if digit >= base {
            return None;
        }

        value = value.wrapping_mul(base).wrapping_add(digit);
    }

    Some((value, width))
}

fn split_width_suffix(digits: &str) -> Option<(&str, Option<u8>)> {
    let bytes = digits.as_bytes();

    if bytes.len() >= 2 && matches!(bytes[bytes.len() - 2], b'i' | b'u') {
        if !digits.ends_with('8') {
            return None;
        }
        return Some((&digits[..digits.len() - 2], Some(1)));
    }

    if bytes.len() >= 3 && matches!(bytes[bytes.len() - 3], b'i' | b'u') {
        let width = match &digits[digits.len() - 2..] {
            "16" => 2,
            "32" => 4,
            "64" => 8,
            _ => return None,
        };
        return Some((&digits[..digits.len() - 3], Some(width)));
    }

    Some((digits, None))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn lex_all(source: &str) -> Vec<Token> {
        let reporter = Reporter::silent();
        let mut tokens = Vec::new();
        lex(&reporter, source, "<test>", &mut tokens).unwrap();
        tokens
    }

    fn single_integer(source: &str) -> (u64, Option<u8>) {
        let tokens = lex_all(source);
        assert_eq!(tokens.len(), 1, "expected one token for {source:?}");
        match tokens[0].kind {
            TokenKind::Integer { value, width } => (value, width),
            ref other => panic!("expected integer for {source:?}, got {other:?}"),
        }
    }

    #[test]
    fn integers_round_trip_in_every_base() {
        for value in [0u64, 1, 5, 42, 255, 6969, u32::MAX as u64, u64::MAX] {
            for (base, prefix) in [(2, "0b"), (6, "0s"), (8, "0o"), (10, ""), (16, "0x")] {
                let mut digits = String::new();
                let mut rest = value;
                loop {
                    digits.insert(
                        0,
                        char::from_digit((rest % base as u64) as u32, base).unwrap(),
                    );
                    rest /= base as u64;
                    if rest == 0 {
                        break;
                    }
                }
                let text = format!("{prefix}{digits}");
                assert_eq!(single_integer(&text), (value, None), "lexing {text:?}");
            }
        }
    }

    #[test]
    fn underscores_are_ignored() {
        assert_eq!(single_integer("1_000_000"), (1_000_000, None));
        assert_eq!(single_integer("0x_ff_ff"), (0xffff, None));
        assert_eq!(single_integer("0b1010_1010"), (0b1010_1010, None));
    }

    #[test]
    fn width_suffixes() {
        assert_eq!(single_integer("7u8"), (7, Some(1)));
        assert_eq!(single_integer("7i8"), (7, Some(1)));
        assert_eq!(single_integer("513u16"), (513, Some(2)));
        assert_eq!(single_integer("70000i32"), (70000, Some(4)));
        assert_eq!(single_integer("5u64"), (5, Some(8)));
        assert_eq!(single_integer("0u8"), (0, Some(1)));
    }

    #[test]
    fn out_of_base_digits_demote_to_words() {
        for text in ["0b2", "0s6", "0o8", "12a", "0xg1", "5u12"] {
            let tokens = lex_all(text);
            assert_eq!(tokens[0].kind, TokenKind::Word, "lexing {text:?}");
        }
    }

    #[test]
    fn keywords_and_words() {
        let tokens = lex_all("foo fun 1 2 + end bar []u16 -- is &fun &foo");
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Word,
                TokenKind::Keyword(Keyword::Function),
                TokenKind::Integer {
                    value: 1,
                    width: None
                },
                TokenKind::Integer {
                    value: 2,
                    width: None
                },
                TokenKind::Word,
                TokenKind::Keyword(Keyword::End),
                TokenKind::Word,
                TokenKind::Keyword(Keyword::Array),
                TokenKind::Keyword(Keyword::StackEffectDivider),
                TokenKind::Keyword(Keyword::StackEffectDefinition),
                TokenKind::Keyword(Keyword::Function),
                TokenKind::AddressOf,
            ],
        );
    }

    #[test]
    fn locations_are_one_based_and_follow_lines() {
        let tokens = lex_all("one two\n  three # comment\nfour");
        let positions: Vec<_> = tokens
            .iter()
            .map(|t| (t.text.as_str(), t.location.line, t.location.column))
            .collect();
        assert_eq!(
            positions,
            vec![("one", 1, 1), ("two", 1, 5), ("three", 2, 3), ("four", 3, 1)],
        );
    }

    #[test]
    fn string_and_char_literals_keep_quotes() {
        let tokens = lex_all(r#" "hello \"world\"" 'a' '\n' "" "#);
        assert_eq!(tokens[0].text, r#""hello \"world\"""#);
        assert!(matches!(tokens[0].kind, TokenKind::Str { id: None }));
        assert_eq!(tokens[1].text, "'a'");
        assert_eq!(tokens[1].kind, TokenKind::Char);
        assert_eq!(tokens[2].text, r"'\n'");
        assert_eq!(tokens[3].text, r#""""#);
    }

    #[test]
    fn unterminated_string_is_fatal() {
        let reporter = Reporter::silent();
        let mut tokens = Vec::new();
        assert!(lex(&reporter, "\"abc", "<test>", &mut tokens).is_err());
    }

    #[test]
    fn empty_char_literal_is_fatal() {
        let reporter = Reporter::silent();
        let mut tokens = Vec::new();
        assert!(lex(&reporter, "''", "<test>", &mut tokens).is_err());
    }

    #[test]
    fn comments_run_to_end_of_line() {
        let tokens = lex_all("# full line\n1 # trailing 2 3\n4");
        let values: Vec<_> = tokens
            .iter()
            .map(|t| match t.kind {
                TokenKind::Integer { value, .. } => value,
                ref other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(values, vec![1, 4]);
    }
}
