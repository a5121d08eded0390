//! Minimal DER writer/reader for the handful of structures this crate emits:
//! the split-key share encoding and the X.509 client-certificate template.
//!
//! Only the constructs actually used are implemented. Parsing of foreign
//! certificates goes through `x509-parser`; this module never reads
//! untrusted input except the split-key share body.

use crate::{CryptoError, CryptoResult};

pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_BIT_STRING: u8 = 0x03;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_NULL: u8 = 0x05;
pub const TAG_OID: u8 = 0x06;
pub const TAG_UTF8_STRING: u8 = 0x0c;
pub const TAG_UTC_TIME: u8 = 0x17;
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_SET: u8 = 0x31;

// OID bodies (content octets only).
pub const OID_SHA256_WITH_RSA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0b];
pub const OID_COMMON_NAME: &[u8] = &[0x55, 0x04, 0x03];
pub const OID_KEY_USAGE: &[u8] = &[0x55, 0x1d, 0x0f];
pub const OID_BASIC_CONSTRAINTS: &[u8] = &[0x55, 0x1d, 0x13];
pub const OID_EXT_KEY_USAGE: &[u8] = &[0x55, 0x1d, 0x25];
pub const OID_CLIENT_AUTH: &[u8] = &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x03, 0x02];
pub const OID_SHA256: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];

fn encode_len(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len() - 1);
        let significant = &bytes[first..];
        out.push(0x80 | significant.len() as u8);
        out.extend_from_slice(significant);
    }
}

/// Tag-length-value.
pub fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 4);
    out.push(tag);
    encode_len(&mut out, content.len());
    out.extend_from_slice(content);
    out
}

pub fn sequence(parts: &[&[u8]]) -> Vec<u8> {
    tlv(TAG_SEQUENCE, &parts.concat())
}

pub fn set(parts: &[&[u8]]) -> Vec<u8> {
    tlv(TAG_SET, &parts.concat())
}

/// INTEGER from unsigned big-endian magnitude bytes.
pub fn integer(magnitude: &[u8]) -> Vec<u8> {
    let stripped: &[u8] = {
        let first = magnitude.iter().position(|&b| b != 0).unwrap_or(magnitude.len().saturating_sub(1));
        &magnitude[first.min(magnitude.len().saturating_sub(1))..]
    };
    let mut content = Vec::with_capacity(stripped.len() + 1);
    if stripped.is_empty() || stripped[0] & 0x80 != 0 {
        content.push(0);
    }
    content.extend_from_slice(stripped);
    tlv(TAG_INTEGER, &content)
}

pub fn oid(body: &[u8]) -> Vec<u8> {
    tlv(TAG_OID, body)
}

pub fn null() -> Vec<u8> {
    tlv(TAG_NULL, &[])
}

pub fn octet_string(content: &[u8]) -> Vec<u8> {
    tlv(TAG_OCTET_STRING, content)
}

pub fn utf8_string(s: &str) -> Vec<u8> {
    tlv(TAG_UTF8_STRING, s.as_bytes())
}

/// BIT STRING with an explicit unused-bit count.
pub fn bit_string(unused_bits: u8, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(content.len() + 1);
    body.push(unused_bits);
    body.extend_from_slice(content);
    tlv(TAG_BIT_STRING, &body)
}

pub fn boolean(value: bool) -> Vec<u8> {
    tlv(0x01, &[if value { 0xff } else { 0x00 }])
}

/// Context-specific constructed tag `[n]`.
pub fn explicit(n: u8, content: &[u8]) -> Vec<u8> {
    tlv(0xa0 | n, content)
}

/// UTCTime, valid for dates in 1950..2050.
pub fn utc_time(t: &chrono::DateTime<chrono::Utc>) -> Vec<u8> {
    tlv(TAG_UTC_TIME, t.format("%y%m%d%H%M%SZ").to_string().as_bytes())
}

/// Cursor over a DER buffer, just enough to read the split-key share body.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> CryptoResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(CryptoError::InvalidKeyFormat("truncated DER".into()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_len(&mut self) -> CryptoResult<usize> {
        let first = self.take(1)?[0];
        if first < 0x80 {
            return Ok(first as usize);
        }
        let count = (first & 0x7f) as usize;
        if count == 0 || count > 8 {
            return Err(CryptoError::InvalidKeyFormat("unsupported DER length".into()));
        }
        let mut len = 0usize;
        for &b in self.take(count)? {
            len = (len << 8) | b as usize;
        }
        Ok(len)
    }

    /// Expect `tag` and return its content bytes.
    pub fn expect(&mut self, tag: u8) -> CryptoResult<&'a [u8]> {
        let got = self.take(1)?[0];
        if got != tag {
            return Err(CryptoError::InvalidKeyFormat(format!(
                "expected DER tag {:#04x}, found {:#04x}",
                tag, got
            )));
        }
        let len = self.read_len()?;
        self.take(len)
    }

    /// INTEGER content as unsigned big-endian magnitude.
    pub fn expect_integer(&mut self) -> CryptoResult<&'a [u8]> {
        let content = self.expect(TAG_INTEGER)?;
        Ok(if content.len() > 1 && content[0] == 0 {
            &content[1..]
        } else {
            content
        })
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_and_long_lengths() {
        let short = tlv(TAG_OCTET_STRING, &[0u8; 10]);
        assert_eq!(short[1], 10);
        let long = tlv(TAG_OCTET_STRING, &vec![0u8; 300]);
        assert_eq!(long[1], 0x82);
        assert_eq!(((long[2] as usize) << 8) | long[3] as usize, 300);
    }

    #[test]
    fn test_integer_sign_padding() {
        // high bit set: a leading zero is required
        assert_eq!(integer(&[0x80]), vec![TAG_INTEGER, 2, 0x00, 0x80]);
        // leading zeros stripped
        assert_eq!(integer(&[0x00, 0x00, 0x7f]), vec![TAG_INTEGER, 1, 0x7f]);
    }

    #[test]
    fn test_reader_roundtrip() {
        let der = sequence(&[&integer(&[0x01, 0x02]), &integer(&[0xff])]);
        let mut outer = Reader::new(&der);
        let body = outer.expect(TAG_SEQUENCE).unwrap();
        let mut inner = Reader::new(body);
        assert_eq!(inner.expect_integer().unwrap(), &[0x01, 0x02]);
        assert_eq!(inner.expect_integer().unwrap(), &[0xff]);
        assert!(inner.is_empty());
    }
}
