use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1};
use nom::character::complete::char;
use nom::character::{is_digit, is_hex_digit, is_oct_digit};
use nom::combinator::{cut, fail, map_opt, opt};
use nom::error::{Error as NomError, ErrorKind};
use nom::sequence::preceded;
use nom::IResult;
use std::str;
use thiserror::Error;

use crate::ast::StringFlags;

/// Field separators inside a rule line are runs of spaces and tabs; other
/// whitespace (vertical tab, form feed) is ordinary data.
pub fn is_rule_whitespace(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

fn radix_value(digits: &[u8], radix: u32) -> Option<u64> {
    str::from_utf8(digits)
        .ok()
        .and_then(|s| u64::from_str_radix(s, radix).ok())
}

// '0x' or '0X' followed by hex digits; once the prefix is seen there is
// no falling back to another radix, a bad or oversized literal is fatal
fn hex_literal(input: &[u8]) -> IResult<&[u8], u64> {
    let (rest, digits) = preceded(
        alt((tag("0x"), tag("0X"))),
        cut(take_while1(is_hex_digit)),
    )(input)?;
    match radix_value(digits, 16) {
        Some(value) => Ok((rest, value)),
        None => Err(nom::Err::Failure(NomError::new(input, ErrorKind::TooLarge))),
    }
}

// a leading zero followed by at least one octal digit; the zero itself is
// not part of the value
fn octal_literal(input: &[u8]) -> IResult<&[u8], u64> {
    map_opt(preceded(char('0'), take_while1(is_oct_digit)), |digits| {
        radix_value(digits, 8)
    })(input)
}

fn decimal_literal(input: &[u8]) -> IResult<&[u8], u64> {
    map_opt(take_while1(is_digit), |digits| radix_value(digits, 10))(input)
}

/// Unsigned integer literal: `0x…`/`0X…` hex, `0…` octal, otherwise decimal.
pub fn unsigned(input: &[u8]) -> IResult<&[u8], u64> {
    alt((hex_literal, octal_literal, decimal_literal))(input)
}

/// Signed integer literal: an optional leading `-` applied to any radix.
pub fn signed(input: &[u8]) -> IResult<&[u8], i64> {
    let (rest, sign) = opt(char('-'))(input)?;
    let (rest, magnitude) = unsigned(rest)?;
    match i64::try_from(magnitude) {
        Ok(value) => Ok((rest, if sign.is_some() { -value } else { value })),
        Err(_) => fail(input),
    }
}

/// Kind and page identifiers: a greedy, possibly empty run of `[0-9a-z]`.
pub fn identifier(input: &[u8]) -> IResult<&[u8], &[u8]> {
    take_while(|b: u8| b.is_ascii_digit() || b.is_ascii_lowercase())(input)
}

/// Failure to decode an escaped byte literal.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EscapeError {
    #[error("escape sequence cut short by end of input")]
    UnfinishedEscape,
    #[error("hex escape with no hex digits")]
    EmptyHexEscape,
    #[error("octal escape \\{0} does not fit in a byte")]
    OctalOverflow(String),
    #[error("unrecognized escape sequence starting with byte 0x{0:02x}")]
    UnknownEscape(u8),
}

/// Decodes an in-rule byte literal. Recognized escapes are
/// `\\ \r \n \t \v \b \a \<space>`, `\xH`/`\xHH` hex, and one to three
/// octal digits; anything else after a backslash is an error. Unescaped
/// bytes pass through untouched and decoding runs to the end of the slice
/// (the caller has already cut the field out of the line).
pub fn decoded_string(input: &[u8]) -> Result<Vec<u8>, EscapeError> {
    let mut out = Vec::with_capacity(input.len());
    let mut j = 0;

    while j < input.len() {
        if input[j] != b'\\' {
            out.push(input[j]);
            j += 1;
            continue;
        }

        j += 1;
        let escape = *input.get(j).ok_or(EscapeError::UnfinishedEscape)?;
        match escape {
            b'\\' => {
                out.push(b'\\');
                j += 1;
            }
            b'r' => {
                out.push(b'\r');
                j += 1;
            }
            b'n' => {
                out.push(b'\n');
                j += 1;
            }
            b't' => {
                out.push(b'\t');
                j += 1;
            }
            b'v' => {
                out.push(0x0b);
                j += 1;
            }
            b'b' => {
                out.push(0x08);
                j += 1;
            }
            b'a' => {
                out.push(0x07);
                j += 1;
            }
            b' ' => {
                out.push(b' ');
                j += 1;
            }
            b'x' => {
                // one or two hex digits, e.g. "\xe" or "\xeb"
                j += 1;
                let mut len = 0;
                while len < 2 && j + len < input.len() && is_hex_digit(input[j + len]) {
                    len += 1;
                }
                match radix_value(&input[j..j + len], 16) {
                    Some(value) => out.push(value as u8),
                    None => return Err(EscapeError::EmptyHexEscape),
                }
                j += len;
            }
            _ if is_oct_digit(escape) => {
                // one to three octal digits, e.g. "\0", "\11", "\222"
                let mut len = 1;
                while len < 3 && j + len < input.len() && is_oct_digit(input[j + len]) {
                    len += 1;
                }
                let digits = &input[j..j + len];
                match radix_value(digits, 8).filter(|value| *value <= 0xff) {
                    Some(value) => out.push(value as u8),
                    None => {
                        return Err(EscapeError::OctalOverflow(
                            String::from_utf8_lossy(digits).into_owned(),
                        ))
                    }
                }
                j += len;
            }
            other => return Err(EscapeError::UnknownEscape(other)),
        }
    }

    Ok(out)
}

/// Renders bytes back into the escaped literal syntax `decoded_string`
/// accepts. Spaces become `\ ` so the result survives field splitting.
pub fn escaped_string(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\r' => out.push_str("\\r"),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            0x0b => out.push_str("\\v"),
            0x08 => out.push_str("\\b"),
            0x07 => out.push_str("\\a"),
            b' ' => out.push_str("\\ "),
            0x21..=0x7e => out.push(char::from(b)),
            _ => {
                let _ = write!(out, "\\x{:02x}", b);
            }
        }
    }
    out
}

/// Scans string-test flag letters, ignoring anything it does not know
/// about (older databases carry flags this dialect never supported).
pub fn string_flags(input: &[u8]) -> StringFlags {
    let mut flags = StringFlags::default();
    for &b in input {
        match b {
            b'W' => flags.compact_whitespace = true,
            b'w' => flags.optional_blanks = true,
            b'c' => flags.lower_matches_both = true,
            b'C' => flags.upper_matches_both = true,
            b't' => flags.force_text = true,
            b'b' => flags.force_binary = true,
            _ => {}
        }
    }
    flags
}
