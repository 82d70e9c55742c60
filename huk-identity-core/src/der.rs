//! Backward-writing DER encoder and PEM armor.
//!
//! [`DerWriter`] fills a caller-supplied buffer from the end towards the
//! start. A structure's content is always written before its tag and
//! length, so every length is known exactly when its prefix is emitted and
//! a single pass suffices. The encoded result is the tail of the buffer.
//!
//! Every `write_*` returns the number of bytes it added, so callers can
//! accumulate the content length of the enclosing structure:
//!
//! ```text
//! len += w.write_integer_u8(0)?;
//! len += w.write_sequence_header(len)?;
//! ```

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::{IdentityError, IdentityResult};

/// INTEGER
pub const TAG_INTEGER: u8 = 0x02;
/// BIT STRING
pub const TAG_BIT_STRING: u8 = 0x03;
/// OBJECT IDENTIFIER
pub const TAG_OID: u8 = 0x06;
/// `UTF8String`
pub const TAG_UTF8_STRING: u8 = 0x0C;
/// SEQUENCE / SEQUENCE OF
pub const TAG_SEQUENCE: u8 = 0x30;
/// SET / SET OF
pub const TAG_SET: u8 = 0x31;
/// Context-specific constructed `[0]`
pub const TAG_CONTEXT_0: u8 = 0xA0;

/// Cursor writing DER right-to-left into a fixed buffer.
pub struct DerWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> DerWriter<'a> {
    /// Starts writing at the end of `buf`.
    pub fn new(buf: &'a mut [u8]) -> Self {
        let pos = buf.len();
        Self { buf, pos }
    }

    /// Bytes written so far.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Whether nothing has been written.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }

    /// Bytes still free in front of the cursor.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.pos
    }

    /// The encoded bytes, which sit at the tail of the buffer.
    #[must_use]
    pub fn written(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Discards everything written so far.
    pub fn reset(&mut self) {
        self.pos = self.buf.len();
    }

    /// Prepends `bytes` verbatim.
    ///
    /// # Errors
    ///
    /// Returns `BufferTooSmall` if `bytes` does not fit in front of the
    /// cursor. Nothing is written in that case.
    pub fn write_raw(&mut self, bytes: &[u8]) -> IdentityResult<usize> {
        if bytes.len() > self.pos {
            return Err(IdentityError::BufferTooSmall);
        }
        let start = self.pos - bytes.len();
        self.buf[start..self.pos].copy_from_slice(bytes);
        self.pos = start;
        Ok(bytes.len())
    }

    /// Prepends one byte.
    ///
    /// # Errors
    ///
    /// Returns `BufferTooSmall` if the buffer is full.
    pub fn write_byte(&mut self, byte: u8) -> IdentityResult<usize> {
        self.write_raw(&[byte])
    }

    /// Prepends a DER length field for `len` content bytes.
    ///
    /// # Errors
    ///
    /// - `BufferTooSmall` if the field does not fit.
    /// - `EncodingFailed` if `len` needs more than two length octets.
    pub fn write_len(&mut self, len: usize) -> IdentityResult<usize> {
        if let Ok(short) = u8::try_from(len) {
            if short < 0x80 {
                return self.write_byte(short);
            }
            return self.write_raw(&[0x81, short]);
        }
        if let Ok(long) = u16::try_from(len) {
            let [hi, lo] = long.to_be_bytes();
            return self.write_raw(&[0x82, hi, lo]);
        }
        Err(IdentityError::EncodingFailed)
    }

    /// Prepends tag and length for `content_len` bytes already written.
    ///
    /// # Errors
    ///
    /// See [`DerWriter::write_len`].
    pub fn write_header(&mut self, tag: u8, content_len: usize) -> IdentityResult<usize> {
        let mut len = self.write_len(content_len)?;
        len += self.write_byte(tag)?;
        Ok(len)
    }

    /// Prepends a SEQUENCE header around `content_len` bytes.
    ///
    /// # Errors
    ///
    /// See [`DerWriter::write_len`].
    pub fn write_sequence_header(&mut self, content_len: usize) -> IdentityResult<usize> {
        self.write_header(TAG_SEQUENCE, content_len)
    }

    /// Prepends a complete primitive element.
    ///
    /// # Errors
    ///
    /// See [`DerWriter::write_len`].
    pub fn write_tagged(&mut self, tag: u8, content: &[u8]) -> IdentityResult<usize> {
        let mut len = self.write_raw(content)?;
        len += self.write_header(tag, content.len())?;
        Ok(len)
    }

    /// Prepends an OBJECT IDENTIFIER from its encoded arcs.
    ///
    /// # Errors
    ///
    /// See [`DerWriter::write_len`].
    pub fn write_oid(&mut self, oid: &[u8]) -> IdentityResult<usize> {
        self.write_tagged(TAG_OID, oid)
    }

    /// Prepends a `UTF8String`.
    ///
    /// # Errors
    ///
    /// See [`DerWriter::write_len`].
    pub fn write_utf8_string(&mut self, value: &str) -> IdentityResult<usize> {
        self.write_tagged(TAG_UTF8_STRING, value.as_bytes())
    }

    /// Prepends a BIT STRING with no unused bits.
    ///
    /// # Errors
    ///
    /// See [`DerWriter::write_len`].
    pub fn write_bit_string(&mut self, bits: &[u8]) -> IdentityResult<usize> {
        let mut len = self.write_raw(bits)?;
        len += self.write_byte(0x00)?;
        len += self.write_header(TAG_BIT_STRING, len)?;
        Ok(len)
    }

    /// Prepends a small non-negative INTEGER.
    ///
    /// # Errors
    ///
    /// See [`DerWriter::write_len`].
    pub fn write_integer_u8(&mut self, value: u8) -> IdentityResult<usize> {
        self.write_unsigned_integer(&[value])
    }

    /// Prepends a big-endian unsigned value as a minimal DER INTEGER.
    ///
    /// Leading zero octets are dropped and a single `0x00` is prepended
    /// when the first remaining octet has its high bit set, so the value
    /// stays non-negative. The value zero is written as `02 01 00`.
    ///
    /// # Errors
    ///
    /// - `EncodingFailed` if `magnitude` is empty.
    /// - `BufferTooSmall` if the element does not fit.
    pub fn write_unsigned_integer(&mut self, magnitude: &[u8]) -> IdentityResult<usize> {
        if magnitude.is_empty() {
            return Err(IdentityError::EncodingFailed);
        }
        let first_non_zero = magnitude
            .iter()
            .position(|&b| b != 0)
            .unwrap_or(magnitude.len() - 1);
        let trimmed = &magnitude[first_non_zero..];

        let mut len = self.write_raw(trimmed)?;
        if trimmed[0] & 0x80 != 0 {
            len += self.write_byte(0x00)?;
        }
        len += self.write_header(TAG_INTEGER, len)?;
        Ok(len)
    }

    /// Prepends an ECDSA signature component as an INTEGER.
    ///
    /// Identical to [`DerWriter::write_unsigned_integer`] except that an
    /// all-zero component, which no valid signature contains, is refused.
    ///
    /// # Errors
    ///
    /// - `EncodingFailed` if the component is zero.
    /// - `BufferTooSmall` if the element does not fit.
    pub fn write_signature_component(&mut self, component: &[u8]) -> IdentityResult<usize> {
        if component.iter().all(|&b| b == 0) {
            return Err(IdentityError::EncodingFailed);
        }
        self.write_unsigned_integer(component)
    }

    /// Prepends `SEQUENCE { INTEGER r, INTEGER s }` from raw `r || s`.
    ///
    /// # Errors
    ///
    /// - `EncodingFailed` if `raw` has odd length or either half is zero.
    /// - `BufferTooSmall` if the element does not fit.
    pub fn write_ecdsa_signature(&mut self, raw: &[u8]) -> IdentityResult<usize> {
        if raw.is_empty() || raw.len() % 2 != 0 {
            return Err(IdentityError::EncodingFailed);
        }
        let (r, s) = raw.split_at(raw.len() / 2);
        let mut len = self.write_signature_component(s)?;
        len += self.write_signature_component(r)?;
        len += self.write_sequence_header(len)?;
        Ok(len)
    }
}

/// Reads a tag and length header from the front of `input`.
///
/// Returns `(tag, content_len, header_len)`. Short-form and one- or
/// two-octet long-form lengths are accepted.
///
/// # Errors
///
/// Returns `EncodingFailed` if the header is truncated or uses another
/// length form.
pub fn read_header(input: &[u8]) -> IdentityResult<(u8, usize, usize)> {
    let (&tag, rest) = input.split_first().ok_or(IdentityError::EncodingFailed)?;
    let (&first, rest) = rest.split_first().ok_or(IdentityError::EncodingFailed)?;
    match first {
        0x00..=0x7F => Ok((tag, usize::from(first), 2)),
        0x81 => {
            let &len = rest.first().ok_or(IdentityError::EncodingFailed)?;
            Ok((tag, usize::from(len), 3))
        }
        0x82 => {
            let bytes = rest.get(..2).ok_or(IdentityError::EncodingFailed)?;
            Ok((tag, (usize::from(bytes[0]) << 8) | usize::from(bytes[1]), 4))
        }
        _ => Err(IdentityError::EncodingFailed),
    }
}

/// Checks that `input` is exactly one SEQUENCE whose declared length covers
/// the remaining bytes.
///
/// # Errors
///
/// Returns `EncodingFailed` otherwise.
pub fn check_sequence(input: &[u8]) -> IdentityResult<usize> {
    let (tag, content_len, header_len) = read_header(input)?;
    if tag != TAG_SEQUENCE || header_len + content_len != input.len() {
        return Err(IdentityError::EncodingFailed);
    }
    Ok(content_len)
}

/// Armors DER bytes between `-----BEGIN <label>-----` and
/// `-----END <label>-----` with 64-character base64 lines.
#[must_use]
pub fn der_to_pem(label: &str, der: &[u8]) -> String {
    let encoded = STANDARD.encode(der);
    let mut pem = String::with_capacity(encoded.len() + encoded.len() / 64 + 2 * label.len() + 40);
    pem.push_str("-----BEGIN ");
    pem.push_str(label);
    pem.push_str("-----\n");
    for line in encoded.as_bytes().chunks(64) {
        // base64 output is ASCII
        pem.push_str(std::str::from_utf8(line).unwrap_or_default());
        pem.push('\n');
    }
    pem.push_str("-----END ");
    pem.push_str(label);
    pem.push_str("-----\n");
    pem
}

/// Strips PEM armor with the given label and decodes the body.
///
/// # Errors
///
/// Returns `EncodingFailed` if the markers are missing or the body is not
/// valid base64.
pub fn pem_to_der(label: &str, pem: &str) -> IdentityResult<Vec<u8>> {
    let begin = format!("-----BEGIN {label}-----");
    let end = format!("-----END {label}-----");
    let start = pem.find(&begin).ok_or(IdentityError::EncodingFailed)? + begin.len();
    let stop = pem[start..]
        .find(&end)
        .ok_or(IdentityError::EncodingFailed)?
        + start;
    let body: String = pem[start..stop]
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    STANDARD
        .decode(body)
        .map_err(|_| IdentityError::EncodingFailed)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(0x05, &[0x05] ; "short form")]
    #[test_case(0x7F, &[0x7F] ; "largest short form")]
    #[test_case(0x80, &[0x81, 0x80] ; "one length octet")]
    #[test_case(0x1234, &[0x82, 0x12, 0x34] ; "two length octets")]
    fn test_write_len(len: usize, expected: &[u8]) {
        let mut buf = [0u8; 8];
        let mut w = DerWriter::new(&mut buf);
        assert_eq!(w.write_len(len).expect("write len"), expected.len());
        assert_eq!(w.written(), expected);
    }

    #[test]
    fn test_write_len_too_long() {
        let mut buf = [0u8; 8];
        let mut w = DerWriter::new(&mut buf);
        assert_eq!(w.write_len(0x1_0000), Err(IdentityError::EncodingFailed));
    }

    #[test_case(&[0x00, 0x00, 0x01], &[0x02, 0x01, 0x01] ; "leading zeros stripped")]
    #[test_case(&[0x80], &[0x02, 0x02, 0x00, 0x80] ; "high bit padded")]
    #[test_case(&[0x00, 0xFF, 0x01], &[0x02, 0x03, 0x00, 0xFF, 0x01] ; "strip then pad")]
    #[test_case(&[0x00, 0x00], &[0x02, 0x01, 0x00] ; "zero")]
    fn test_write_unsigned_integer(magnitude: &[u8], expected: &[u8]) {
        let mut buf = [0u8; 16];
        let mut w = DerWriter::new(&mut buf);
        let len = w.write_unsigned_integer(magnitude).expect("write integer");
        assert_eq!(len, expected.len());
        assert_eq!(w.written(), expected);
    }

    #[test]
    fn test_zero_signature_component_rejected() {
        let mut buf = [0u8; 16];
        let mut w = DerWriter::new(&mut buf);
        assert_eq!(
            w.write_signature_component(&[0u8; 32]),
            Err(IdentityError::EncodingFailed)
        );
    }

    #[test]
    fn test_ecdsa_signature_encoding() {
        let mut raw = [0u8; 64];
        raw[0] = 0x80;
        raw[31] = 0x01;
        raw[32] = 0x00;
        raw[33] = 0x7F;
        raw[63] = 0x02;

        let mut buf = [0u8; 128];
        let mut w = DerWriter::new(&mut buf);
        let len = w.write_ecdsa_signature(&raw).expect("write signature");
        let der = w.written();
        assert_eq!(len, der.len());

        // r keeps all 32 bytes plus a pad, s loses its leading zero
        assert_eq!(&der[..2], &[0x30, 2 + 33 + 2 + 31]);
        assert_eq!(&der[2..5], &[0x02, 33, 0x00]);
        assert_eq!(der[5], 0x80);
        assert_eq!(&der[37..40], &[0x02, 31, 0x7F]);
        assert_eq!(check_sequence(der), Ok(der.len() - 2));
    }

    #[test]
    fn test_buffer_too_small_writes_nothing() {
        let mut buf = [0u8; 3];
        let mut w = DerWriter::new(&mut buf);
        w.write_byte(0xAA).expect("one byte fits");
        assert_eq!(w.write_raw(&[1, 2, 3]), Err(IdentityError::BufferTooSmall));
        assert_eq!(w.written(), &[0xAA]);
        assert_eq!(w.remaining(), 2);
    }

    #[test]
    fn test_bit_string() {
        let mut buf = [0u8; 8];
        let mut w = DerWriter::new(&mut buf);
        w.write_bit_string(&[0x04, 0x01]).expect("write bit string");
        assert_eq!(w.written(), &[0x03, 0x03, 0x00, 0x04, 0x01]);
    }

    #[test]
    fn test_read_header_forms() {
        assert_eq!(read_header(&[0x30, 0x05]), Ok((0x30, 5, 2)));
        assert_eq!(read_header(&[0x30, 0x81, 0xC8]), Ok((0x30, 200, 3)));
        assert_eq!(read_header(&[0x30, 0x82, 0x01, 0x2C]), Ok((0x30, 300, 4)));
        assert_eq!(read_header(&[0x30, 0x83]), Err(IdentityError::EncodingFailed));
        assert_eq!(read_header(&[0x30]), Err(IdentityError::EncodingFailed));
    }

    #[test]
    fn test_check_sequence_length_mismatch() {
        assert_eq!(
            check_sequence(&[0x30, 0x02, 0x05, 0x00, 0xFF]),
            Err(IdentityError::EncodingFailed)
        );
        assert_eq!(
            check_sequence(&[0x31, 0x02, 0x05, 0x00]),
            Err(IdentityError::EncodingFailed)
        );
    }

    #[test]
    fn test_pem_lines_and_markers() {
        let der = vec![0x5Au8; 100];
        let pem = der_to_pem("PUBLIC KEY", &der);
        let lines: Vec<&str> = pem.lines().collect();
        assert_eq!(lines.first(), Some(&"-----BEGIN PUBLIC KEY-----"));
        assert_eq!(lines.last(), Some(&"-----END PUBLIC KEY-----"));
        assert!(lines[1..lines.len() - 1].iter().all(|line| line.len() <= 64));
        assert_eq!(lines[1].len(), 64);
        assert_eq!(pem_to_der("PUBLIC KEY", &pem).expect("decode"), der);
    }

    #[test]
    fn test_pem_wrong_label() {
        let pem = der_to_pem("PUBLIC KEY", &[1, 2, 3]);
        assert_eq!(
            pem_to_der("CERTIFICATE REQUEST", &pem),
            Err(IdentityError::EncodingFailed)
        );
    }
}
