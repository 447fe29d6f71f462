//! Compact wire representation for protocol names.
//!
//! A [`WireString`] stores text as UTF-16 code units, two bytes each, low byte
//! first. Addresses, queue names, filters and property keys all travel in this
//! form, so equality and hashing work directly on the bytes and never decode.

use bytes::{Buf, BufMut, Bytes};
use once_cell::sync::OnceCell;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::RavenClientError;
use crate::Result;

/// Size of the length prefix in the serialized form
pub const SIZE_INT: usize = 4;

/// Size of the presence flag in the nullable serialized form
pub const SIZE_BOOLEAN: usize = 1;

const NULL: u8 = 0;
const NOT_NULL: u8 = 1;

fn length_prefix(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| {
        RavenClientError::protocol(format!(
            "Wire string of {} bytes exceeds the length prefix",
            len
        ))
    })
}

/// Immutable byte-encoded text value
#[derive(Clone)]
pub struct WireString {
    data: Bytes,
    text: OnceCell<String>,
}

impl WireString {
    /// Encode text into its wire form
    pub fn from_text(text: &str) -> Self {
        let mut data = Vec::with_capacity(text.len() * 2);
        for unit in text.encode_utf16() {
            data.extend_from_slice(&unit.to_le_bytes());
        }

        Self {
            data: Bytes::from(data),
            text: OnceCell::with_value(text.to_owned()),
        }
    }

    /// Wrap already encoded bytes
    pub fn from_bytes(data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        if data.len() % 2 != 0 {
            return Err(RavenClientError::protocol(format!(
                "Wire string payload must have an even length, got {} bytes",
                data.len()
            )));
        }

        Ok(Self {
            data,
            text: OnceCell::new(),
        })
    }

    /// Number of UTF-16 code units
    pub fn len(&self) -> usize {
        self.data.len() >> 1
    }

    /// Whether the value has no code units
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Encoded payload
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Encoded payload as shared bytes
    pub fn to_bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Code unit at `index`
    pub fn char_at(&self, index: usize) -> Result<u16> {
        if index >= self.len() {
            return Err(RavenClientError::IndexOutOfBounds {
                index,
                length: self.len(),
            });
        }
        Ok(self.unit(index << 1))
    }

    /// Code units in `[start, end)`
    pub fn sub_sequence(&self, start: usize, end: usize) -> Result<WireString> {
        let len = self.len();
        if end < start || end > len {
            return Err(RavenClientError::IndexOutOfBounds {
                index: if end > len { end } else { start },
                length: len,
            });
        }

        Ok(Self {
            data: self.data.slice(start << 1..end << 1),
            text: OnceCell::new(),
        })
    }

    /// Value followed by `other`
    pub fn concat(&self, other: &WireString) -> WireString {
        let mut data = Vec::with_capacity(self.data.len() + other.data.len());
        data.extend_from_slice(&self.data);
        data.extend_from_slice(&other.data);
        Self {
            data: Bytes::from(data),
            text: OnceCell::new(),
        }
    }

    /// Value followed by the encoded `other`
    pub fn concat_str(&self, other: &str) -> WireString {
        self.concat(&WireString::from_text(other))
    }

    /// Value followed by `c`
    pub fn concat_char(&self, c: char) -> WireString {
        let mut units = [0u16; 2];
        let mut data = Vec::with_capacity(self.data.len() + 4);
        data.extend_from_slice(&self.data);
        for unit in c.encode_utf16(&mut units) {
            data.extend_from_slice(&unit.to_le_bytes());
        }
        Self {
            data: Bytes::from(data),
            text: OnceCell::new(),
        }
    }

    /// Byte-prefix comparison
    pub fn starts_with(&self, other: &WireString) -> bool {
        self.data.starts_with(&other.data)
    }

    /// Whether the code unit for `c` occurs
    pub fn contains(&self, c: char) -> bool {
        match bmp_unit(c) {
            Some(unit) => self.positions(unit).next().is_some(),
            None => false,
        }
    }

    /// Split on every occurrence of `delim`.
    ///
    /// Always returns at least one element. When the delimiter is absent the
    /// result is the original value alone.
    pub fn split(&self, delim: char) -> Vec<WireString> {
        let Some(unit) = bmp_unit(delim) else {
            return vec![self.clone()];
        };

        let mut parts = Vec::new();
        let mut last = 0;
        for pos in self.positions(unit) {
            parts.push(Self {
                data: self.data.slice(last..pos),
                text: OnceCell::new(),
            });
            last = pos + 2;
        }

        if parts.is_empty() {
            return vec![self.clone()];
        }

        parts.push(Self {
            data: self.data.slice(last..),
            text: OnceCell::new(),
        });
        parts
    }

    /// Serialized size: length prefix plus payload
    pub fn size_of(&self) -> usize {
        SIZE_INT + self.data.len()
    }

    /// Serialized size of an optional value
    pub fn size_of_nullable(value: Option<&WireString>) -> usize {
        match value {
            Some(s) => SIZE_BOOLEAN + s.size_of(),
            None => SIZE_BOOLEAN,
        }
    }

    /// Write the length-prefixed form; payloads over `i32::MAX` bytes are
    /// refused
    pub fn write_to(&self, buf: &mut impl BufMut) -> Result<()> {
        buf.put_i32(length_prefix(self.data.len())?);
        buf.put_slice(&self.data);
        Ok(())
    }

    /// Read a length-prefixed value
    pub fn read_from(buf: &mut impl Buf) -> Result<WireString> {
        if buf.remaining() < SIZE_INT {
            return Err(RavenClientError::protocol(
                "Insufficient bytes for wire string length",
            ));
        }

        let len = buf.get_i32();
        if len < 0 || buf.remaining() < len as usize {
            return Err(RavenClientError::protocol(format!(
                "Invalid wire string length {}",
                len
            )));
        }

        Self::from_bytes(buf.copy_to_bytes(len as usize))
    }

    /// Write a presence flag followed by the value, if any
    pub fn write_nullable(value: Option<&WireString>, buf: &mut impl BufMut) -> Result<()> {
        match value {
            Some(s) => {
                buf.put_u8(NOT_NULL);
                s.write_to(buf)
            }
            None => {
                buf.put_u8(NULL);
                Ok(())
            }
        }
    }

    /// Read a presence flag and the value, if any
    pub fn read_nullable(buf: &mut impl Buf) -> Result<Option<WireString>> {
        if buf.remaining() < SIZE_BOOLEAN {
            return Err(RavenClientError::protocol(
                "Insufficient bytes for nullable flag",
            ));
        }

        match buf.get_u8() {
            NULL => Ok(None),
            NOT_NULL => Self::read_from(buf).map(Some),
            flag => Err(RavenClientError::protocol(format!(
                "Invalid nullable flag {}",
                flag
            ))),
        }
    }

    /// Decoded text, computed once
    pub fn as_text(&self) -> &str {
        self.text.get_or_init(|| {
            let units: Vec<u16> = (0..self.len()).map(|i| self.unit(i << 1)).collect();
            String::from_utf16_lossy(&units)
        })
    }

    fn unit(&self, byte_pos: usize) -> u16 {
        u16::from_le_bytes([self.data[byte_pos], self.data[byte_pos + 1]])
    }

    fn positions(&self, unit: u16) -> impl Iterator<Item = usize> + '_ {
        let [low, high] = unit.to_le_bytes();
        (0..self.data.len())
            .step_by(2)
            .filter(move |&i| self.data[i] == low && self.data[i + 1] == high)
    }
}

fn bmp_unit(c: char) -> Option<u16> {
    u16::try_from(c as u32).ok()
}

impl PartialEq for WireString {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for WireString {}

impl Hash for WireString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.data.hash(state);
    }
}

impl PartialOrd for WireString {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WireString {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_text().cmp(other.as_text())
    }
}

impl PartialEq<str> for WireString {
    fn eq(&self, other: &str) -> bool {
        self.as_text() == other
    }
}

impl PartialEq<&str> for WireString {
    fn eq(&self, other: &&str) -> bool {
        self.as_text() == *other
    }
}

impl From<&str> for WireString {
    fn from(text: &str) -> Self {
        Self::from_text(text)
    }
}

impl From<String> for WireString {
    fn from(text: String) -> Self {
        Self::from_text(&text)
    }
}

impl From<&String> for WireString {
    fn from(text: &String) -> Self {
        Self::from_text(text)
    }
}

impl fmt::Display for WireString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_text())
    }
}

impl fmt::Debug for WireString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WireString({:?})", self.as_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use proptest::prelude::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(s: &WireString) -> u64 {
        let mut hasher = DefaultHasher::new();
        s.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_encoding_is_little_endian_utf16() {
        let s = WireString::from_text("Aé");
        assert_eq!(s.as_bytes(), &[0x41, 0x00, 0xE9, 0x00]);
        assert_eq!(s.len(), 2);
        assert_eq!(s.char_at(1).unwrap(), 0xE9);
    }

    #[test]
    fn test_decoded_text_from_raw_bytes() {
        let s = WireString::from_bytes(vec![0x68, 0x00, 0x69, 0x00]).unwrap();
        assert_eq!(s.as_text(), "hi");
        assert_eq!(s, WireString::from_text("hi"));
    }

    #[test]
    fn test_odd_length_bytes_rejected() {
        assert!(WireString::from_bytes(vec![0x41, 0x00, 0x42]).is_err());
    }

    #[test]
    fn test_char_at_bounds() {
        let s = WireString::from("abc");
        assert!(s.char_at(2).is_ok());
        assert!(matches!(
            s.char_at(3),
            Err(RavenClientError::IndexOutOfBounds { index: 3, length: 3 })
        ));
    }

    #[test]
    fn test_sub_sequence() {
        let s = WireString::from("jms.queue.orders");
        assert_eq!(s.sub_sequence(4, 9).unwrap(), "queue");
        assert_eq!(s.sub_sequence(3, 3).unwrap().len(), 0);
        assert!(s.sub_sequence(5, 4).is_err());
        assert!(s.sub_sequence(0, 17).is_err());
    }

    #[test]
    fn test_concat_and_starts_with() {
        let prefix = WireString::from("jms.");
        let name = prefix.concat_str("queue").concat_char('.').concat(&"a".into());
        assert_eq!(name, "jms.queue.a");
        assert!(name.starts_with(&prefix));
        assert!(!prefix.starts_with(&name));
    }

    #[test]
    fn test_split() {
        let s = WireString::from("a.b..c");
        let parts: Vec<String> = s.split('.').iter().map(|p| p.to_string()).collect();
        assert_eq!(parts, vec!["a", "b", "", "c"]);

        let single = WireString::from("abc");
        assert_eq!(single.split('.'), vec![single.clone()]);
        assert_eq!(single.split('😀'), vec![single.clone()]);
    }

    #[test]
    fn test_sizes() {
        let s = WireString::from("abc");
        assert_eq!(s.size_of(), 4 + 6);
        assert_eq!(WireString::size_of_nullable(Some(&s)), 1 + 4 + 6);
        assert_eq!(WireString::size_of_nullable(None), 1);
    }

    #[test]
    fn test_serialized_form() {
        let s = WireString::from("ab");
        let mut buf = BytesMut::new();
        s.write_to(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 4, b'a', 0, b'b', 0]);
        assert_eq!(buf.len(), s.size_of());

        let decoded = WireString::read_from(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, s);
    }

    #[test]
    fn test_length_prefix_limit() {
        assert_eq!(length_prefix(0).unwrap(), 0);
        assert_eq!(length_prefix(i32::MAX as usize).unwrap(), i32::MAX);
        assert!(matches!(
            length_prefix(i32::MAX as usize + 1),
            Err(RavenClientError::Protocol { .. })
        ));
    }

    #[test]
    fn test_nullable_serialized_form() {
        let mut buf = BytesMut::new();
        WireString::write_nullable(None, &mut buf).unwrap();
        WireString::write_nullable(Some(&"x".into()), &mut buf).unwrap();
        assert_eq!(buf.len(), 1 + 1 + 4 + 2);

        let mut bytes = buf.freeze();
        assert_eq!(WireString::read_nullable(&mut bytes).unwrap(), None);
        assert_eq!(
            WireString::read_nullable(&mut bytes).unwrap(),
            Some(WireString::from("x"))
        );
    }

    #[test]
    fn test_truncated_input_rejected() {
        let mut short = Bytes::from_static(&[0, 0, 0, 8, 1, 0]);
        assert!(WireString::read_from(&mut short).is_err());
    }

    #[test]
    fn test_ordering_uses_text() {
        let mut names = vec![WireString::from("b"), WireString::from("a")];
        names.sort();
        assert_eq!(names[0], "a");
    }

    proptest! {
        #[test]
        fn prop_round_trip(text in ".*") {
            let encoded = WireString::from_text(&text);
            prop_assert_eq!(encoded.as_bytes().len(), 2 * text.encode_utf16().count());

            let decoded = WireString::from_bytes(encoded.to_bytes()).unwrap();
            prop_assert_eq!(decoded.as_text(), text.as_str());
        }

        #[test]
        fn prop_equal_bytes_equal_hash(text in ".*") {
            let a = WireString::from_text(&text);
            let b = WireString::from_bytes(a.to_bytes()).unwrap();
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(hash_of(&a), hash_of(&b));
        }

        #[test]
        fn prop_different_lengths_never_equal(a in ".*", b in ".*") {
            let wa = WireString::from_text(&a);
            let wb = WireString::from_text(&b);
            if wa.as_bytes().len() != wb.as_bytes().len() {
                prop_assert_ne!(wa, wb);
            }
        }

        #[test]
        fn prop_split_rejoins(parts in proptest::collection::vec("[a-z]{0,6}", 1..6)) {
            let joined = parts.join(".");
            let s = WireString::from_text(&joined);
            let split = s.split('.');
            let occurrences = joined.matches('.').count();
            prop_assert_eq!(split.len(), occurrences + 1);

            let mut rebuilt = split[0].clone();
            for part in &split[1..] {
                rebuilt = rebuilt.concat_char('.').concat(part);
            }
            prop_assert_eq!(rebuilt, s);
        }

        #[test]
        fn prop_split_without_delimiter(text in "[a-z]{0,12}") {
            let s = WireString::from_text(&text);
            prop_assert_eq!(s.split('/'), vec![s.clone()]);
        }
    }
}
