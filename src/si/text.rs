//! DVB text field decoding per ETSI EN 300 468 Annex A.
//!
//! Text fields either open with a character-set selection byte (0x01..=0x1F) or use the default
//! ISO/IEC 6937 table, where 0xC1..=0xCF prefix bytes introduce a combining diacritic applied to
//! the following base letter.

use crate::{Error, ErrorDetails, Result};
use encoding_rs::Encoding;
use log::warn;

const LINE_BREAK: u8 = 0x8a;

struct AccentTable {
    prefix: u8,
    bases: &'static str,
    composed: &'static str,
}

impl AccentTable {
    fn compose(&self, base: char) -> char {
        match self.bases.find(base) {
            /* bases is pure ASCII, so the byte index doubles as the char index */
            Some(index) => self.composed.chars().nth(index).unwrap_or(base),
            None => base,
        }
    }
}

/// ISO/IEC 6937 diacritic prefixes and the base letters each one composes with.
#[rustfmt::skip]
const ACCENTS: [AccentTable; 13] = [
    AccentTable { prefix: 0xc1, bases: "AEIOUaeiou", composed: "ÀÈÌÒÙàèìòù" },
    AccentTable { prefix: 0xc2, bases: "ACEILNORSUYZaceilnorsuyz", composed: "ÁĆÉÍĹŃÓŔŚÚÝŹáćéíĺńóŕśúýź" },
    AccentTable { prefix: 0xc3, bases: "ACEGHIJOSUWYaceghijosuwy", composed: "ÂĈÊĜĤÎĴÔŜÛŴŶâĉêĝĥîĵôŝûŵŷ" },
    AccentTable { prefix: 0xc4, bases: "AINOUainou", composed: "ÃĨÑÕŨãĩñõũ" },
    AccentTable { prefix: 0xc5, bases: "AEIOUaeiou", composed: "ĀĒĪŌŪāēīōū" },
    AccentTable { prefix: 0xc6, bases: "AGUagu", composed: "ĂĞŬăğŭ" },
    AccentTable { prefix: 0xc7, bases: "CEGIZcegz", composed: "ĊĖĠİŻċėġż" },
    AccentTable { prefix: 0xc8, bases: "AEIOUYaeiouy", composed: "ÄËÏÖÜŸäëïöüÿ" },
    AccentTable { prefix: 0xca, bases: "AUau", composed: "ÅŮåů" },
    AccentTable { prefix: 0xcb, bases: "CGKLNRSTcgklnrst", composed: "ÇĢĶĻŅŖŞŢçģķļņŗşţ" },
    AccentTable { prefix: 0xcd, bases: "OUou", composed: "ŐŰőű" },
    AccentTable { prefix: 0xce, bases: "AEIUaeiu", composed: "ĄĘĮŲąęįų" },
    AccentTable { prefix: 0xcf, bases: "CDELNRSTZcdelnrstz", composed: "ČĎĚĽŇŘŠŤŽčďěľňřšťž" },
];

/// Decodes a DVB text field, yielding an empty string for character sets this implementation
/// does not handle.
pub fn decode(data: &[u8]) -> String {
    decode_with_mode(data, false).unwrap_or_default()
}

/// Decodes a DVB text field, failing with [`ErrorDetails::UnsupportedEncoding`] when the field
/// selects a character set this implementation does not handle.
pub fn decode_strict(data: &[u8]) -> Result<String> {
    decode_with_mode(data, true)
}

fn decode_with_mode(data: &[u8], strict: bool) -> Result<String> {
    let (&prefix, rest) = match data.split_first() {
        Some(split) => split,
        None => return Ok(String::new()),
    };
    match prefix {
        0x01..=0x05 => match iso8859(u16::from(prefix) + 4) {
            Some(encoding) => Ok(decode_single_byte(encoding, rest)),
            None => unsupported(prefix, strict),
        },
        0x10 => {
            /* The next two bytes select an ISO 8859 table number */
            if rest.len() < 2 {
                return unsupported(prefix, strict);
            }
            match iso8859(u16::from_be_bytes([rest[0], rest[1]])) {
                Some(encoding) => Ok(decode_single_byte(encoding, &rest[2..])),
                None => unsupported(prefix, strict),
            }
        }
        0x06..=0x1f => unsupported(prefix, strict),
        _ => Ok(decode_default_table(data)),
    }
}

fn unsupported(prefix: u8, strict: bool) -> Result<String> {
    if strict {
        Err(Error::new(0, ErrorDetails::UnsupportedEncoding(prefix)))
    } else {
        warn!("Unsupported DVB text encoding prefix 0x{:02x}", prefix);
        Ok(String::new())
    }
}

fn iso8859(table: u16) -> Option<&'static Encoding> {
    if !(1..=16).contains(&table) {
        return None;
    }
    Encoding::for_label(format!("iso-8859-{}", table).as_bytes())
}

fn decode_single_byte(encoding: &'static Encoding, bytes: &[u8]) -> String {
    let (text, _) = encoding.decode_without_bom_handling(bytes);
    text.into_owned()
}

fn decode_default_table(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    let mut accent: Option<&AccentTable> = None;
    for &b in data {
        match b {
            0x20..=0x7f => {
                let base = b as char;
                match accent.take() {
                    Some(table) => out.push(table.compose(base)),
                    None => out.push(base),
                }
            }
            0x80..=0x9f => {
                /* Control codes reset any pending accent. Only the line break emits anything;
                 * emphasis toggles (0x86/0x87) and the rest are consumed silently. */
                accent = None;
                if b == LINE_BREAK {
                    out.push('\n');
                }
            }
            _ => {
                if let Some(table) = ACCENTS.iter().find(|t| t.prefix == b) {
                    accent = Some(table);
                }
                /* Every other byte is dropped */
            }
        }
    }
    out
}

/// Normalizes a 3-byte ISO 639-2 language code, falling back to "und" for empty or NUL-padded
/// codes.
pub fn language_code(bytes: &[u8; 3]) -> String {
    let code: String = bytes
        .iter()
        .filter(|b| b.is_ascii_alphabetic())
        .map(|&b| b.to_ascii_lowercase() as char)
        .collect();
    if code.len() == 3 {
        code
    } else {
        "und".to_owned()
    }
}
