//! Lossy repair of operator-entered text before it crosses the wire.
//!
//! Human feedback may arrive with broken multi-byte sequences (pasted binary,
//! a terminal that split a character) or as JSON carrying lone UTF-16
//! surrogate escapes. Both would make a strict decoder reject the whole
//! payload, so they are replaced with U+FFFD instead.

use std::borrow::Cow;

const REPLACEMENT_ESCAPE: &str = "\\uFFFD";

/// Decode bytes as UTF-8, replacing invalid sequences with U+FFFD.
pub fn lossy_text(bytes: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(bytes)
}

/// Prepare a raw JSON body for strict decoding.
///
/// Invalid UTF-8 is replaced first, then unpaired `\uD800`-`\uDFFF` escapes.
/// Syntax errors are left for the JSON parser to report.
pub fn json_payload(bytes: &[u8]) -> Cow<'_, str> {
    match lossy_text(bytes) {
        Cow::Borrowed(text) => repair_surrogate_escapes(text),
        Cow::Owned(text) => Cow::Owned(repair_surrogate_escapes(&text).into_owned()),
    }
}

/// Replace `\uXXXX` escapes that encode an unpaired UTF-16 surrogate.
///
/// A high surrogate immediately followed by a low surrogate escape is a valid
/// pair and is kept. Escaped backslashes (`\\u...`) are not escapes.
pub fn repair_surrogate_escapes(text: &str) -> Cow<'_, str> {
    let bytes = text.as_bytes();
    let mut out: Option<String> = None;
    let mut copied = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'\\' {
            i += 1;
            continue;
        }
        let Some(unit) = escaped_unit(bytes, i) else {
            // Any other escape (including `\\`) spans two bytes.
            i += 2;
            continue;
        };
        let width = match unit {
            0xD800..=0xDBFF => match escaped_unit(bytes, i + 6) {
                Some(0xDC00..=0xDFFF) => 12,
                _ => 0,
            },
            0xDC00..=0xDFFF => 0,
            _ => 6,
        };
        if width > 0 {
            i += width;
            continue;
        }

        let buf = out.get_or_insert_with(|| String::with_capacity(text.len()));
        buf.push_str(&text[copied..i]);
        buf.push_str(REPLACEMENT_ESCAPE);
        i += 6;
        copied = i;
    }

    match out {
        Some(mut buf) => {
            buf.push_str(&text[copied..]);
            Cow::Owned(buf)
        }
        None => Cow::Borrowed(text),
    }
}

/// Parse the code unit of a `\uXXXX` escape starting at `at`.
fn escaped_unit(bytes: &[u8], at: usize) -> Option<u16> {
    let escape = bytes.get(at..at + 6)?;
    if escape[0] != b'\\' || escape[1] != b'u' {
        return None;
    }
    let hex = std::str::from_utf8(&escape[2..]).ok()?;
    u16::from_str_radix(hex, 16).ok()
}
