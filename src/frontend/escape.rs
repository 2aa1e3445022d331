//! Escape-sequence decoding shared by string and char literals.
//!
//! Both literal kinds use the same escapes but feed different sinks: string
//! interning accumulates bytes, char literals pack them into an integer. The
//! sink returns `false` to stop decoding early (e.g. a char literal that ran
//! out of room).

use crate::{
    frontend::Location,
    report::{CResult, Reporter},
};

/// Decodes `payload` (literal text without the surrounding quotes), feeding
/// each resulting byte to `sink`.
///
/// Supported escapes: `\0 \" \' \\ \e \n \r \t \xHH \uHHHH \UHHHHHHHH`.
/// Unicode escapes are encoded to UTF-8 and appended byte by byte.
pub fn decode(
    reporter: &Reporter,
    location: Location,
    payload: &str,
    sink: &mut dyn FnMut(u8) -> bool,
) -> CResult<()> {
    let bytes = payload.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let byte = bytes[i];

        if byte != b'\\' {
            if !sink(byte) {
                return Ok(());
            }
            i += 1;
            continue;
        }

        i += 1;
        let Some(&escaped) = bytes.get(i) else {
            break;
        };

        let decoded = match escaped {
            b'0' => 0,
            b'"' => b'"',
            b'\'' => b'\'',
            b'\\' => b'\\',
            b'e' => 27,
            b'n' => b'\n',
            b'r' => b'\r',
            b't' => b'\t',
            b'x' => {
                if i + 2 >= bytes.len() {
                    return Err(reporter.fatal_at(
                        location,
                        "hex escape sequences must be exactly two digits long",
                    ));
                }

                let mut value = 0u8;
                for j in 0..2 {
                    match hex_digit(bytes[i + 1 + j]) {
                        Some(digit) => value = (value << 4) | digit,
                        None => {
                            reporter.error_at(
                                location,
                                format!(
                                    "expected hexadecimal digit, found: {}",
                                    bytes[i + 1 + j] as char
                                ),
                            );
                            value <<= 4;
                        }
                    }
                }
                i += 2;
                value
            }
            b'u' | b'U' => {
                let length = if escaped == b'u' { 4 } else { 8 };

                if i + length >= bytes.len() {
                    return Err(reporter.fatal_at(
                        location,
                        format!("unicode escape sequences must be exactly {length} digits long"),
                    ));
                }

                let mut rune: u32 = 0;
                for j in 0..length {
                    let Some(digit) = hex_digit(bytes[i + 1 + j]) else {
                        return Err(reporter.fatal_at(
                            location,
                            "found a non-hexadecimal digit inside a unicode escape sequence",
                        ));
                    };
                    rune = (rune << 4) | digit as u32;
                }

                let Some(ch) = char::from_u32(rune) else {
                    return Err(reporter.fatal_at(
                        location,
                        format!("`\\{}{rune:0length$x}` is not a unicode scalar value", escaped as char),
                    ));
                };

                let mut buffer = [0u8; 4];
                for &encoded in ch.encode_utf8(&mut buffer).as_bytes() {
                    if !sink(encoded) {
                        return Ok(());
                    }
                }

                i += length + 1;
                continue;
            }
            other => {
                reporter.error_at(
                    location,
                    format!("unrecognized escape sequence: '\\{}'", other as char),
                );
                other
            }
        };

        if !sink(decoded) {
            return Ok(());
        }
        i += 1;
    }

    Ok(())
}

fn hex_digit(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn decode_all(payload: &str) -> Vec<u8> {
        let reporter = Reporter::silent();
        let mut out = Vec::new();
        decode(&reporter, Location::builtin(), payload, &mut |b| {
            out.push(b);
            true
        })
        .unwrap();
        out
    }

    #[test]
    fn plain_bytes_pass_through() {
        assert_eq!(decode_all("hello"), b"hello");
    }

    #[test]
    fn simple_escapes() {
        assert_eq!(
            decode_all("\\0\\n\\r\\t\\e\\\\\\'\\\""),
            vec![0, b'\n', b'\r', b'\t', 27, b'\\', b'\'', b'"'],
        );
    }

    #[test]
    fn hex_escape() {
        assert_eq!(decode_all(r"\x41\x0a\xFF"), vec![0x41, 0x0a, 0xff]);
    }

    #[test]
    fn unicode_escapes_encode_utf8() {
        assert_eq!(decode_all(r"\u0105"), "ą".as_bytes());
        assert_eq!(decode_all(r"\U0001F600"), "😀".as_bytes());
        // Raw multibyte text passes through untouched.
        assert_eq!(decode_all("ą"), "ą".as_bytes());
    }

    #[test]
    fn surrogate_rune_is_fatal() {
        let reporter = Reporter::silent();
        let result = decode(&reporter, Location::builtin(), r"\uD800", &mut |_| true);
        assert!(result.is_err());
    }

    #[test]
    fn truncated_unicode_escape_is_fatal() {
        let reporter = Reporter::silent();
        let result = decode(&reporter, Location::builtin(), r"\u01", &mut |_| true);
        assert!(result.is_err());
    }

    #[test]
    fn sink_can_stop_decoding() {
        let reporter = Reporter::silent();
        let mut seen = 0;
        decode(&reporter, Location::builtin(), "abcdef", &mut |_| {
            seen += 1;
            seen < 3
        })
        .unwrap();
        assert_eq!(seen, 3);
    }
}
