//! Text helpers shared by CLOB handling: incremental UTF-8 character
//! reading and SQL literal rendering.

use std::fmt::Write as _;
use std::io::{self, BufRead};

/// Read up to `max_chars` characters of UTF-8 text from `reader`, appending
/// them to `out`. Returns the number of characters read; fewer than
/// `max_chars` means the reader is exhausted.
///
/// Never consumes bytes past the last returned character.
pub fn read_chars<R: BufRead + ?Sized>(
    reader: &mut R,
    out: &mut String,
    max_chars: usize,
) -> io::Result<usize> {
    let mut count = 0;

    while count < max_chars {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            break;
        }

        let valid = match std::str::from_utf8(available) {
            Ok(text) => text,
            Err(e) if e.valid_up_to() > 0 => {
                std::str::from_utf8(&available[..e.valid_up_to()]).map_err(invalid_utf8)?
            }
            Err(e) if e.error_len().is_none() => {
                // Character split across the buffer boundary.
                let width = utf8_width(available[0]);
                let mut bytes = [0u8; 4];
                reader.read_exact(&mut bytes[..width])?;
                let text = std::str::from_utf8(&bytes[..width]).map_err(invalid_utf8)?;
                out.push_str(text);
                count += 1;
                continue;
            }
            Err(e) => return Err(invalid_utf8(e)),
        };

        let wanted = max_chars - count;
        let (taken, end) = match valid.char_indices().nth(wanted) {
            Some((end, _)) => (wanted, end),
            None => (valid.chars().count(), valid.len()),
        };
        out.push_str(&valid[..end]);
        count += taken;
        reader.consume(end);
    }

    Ok(count)
}

/// Quote `s` as a single-quoted SQL string literal.
pub fn quote_sql(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('\'');
    for c in s.chars() {
        if c == '\'' {
            quoted.push('\'');
        }
        quoted.push(c);
    }
    quoted.push('\'');
    quoted
}

/// Uppercase hexadecimal rendering of `bytes`.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(hex, "{:02X}", b);
    }
    hex
}

fn utf8_width(first: u8) -> usize {
    match first {
        0xF0..=0xF7 => 4,
        0xE0..=0xEF => 3,
        0xC0..=0xDF => 2,
        _ => 1,
    }
}

fn invalid_utf8(e: std::str::Utf8Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}
