//! Wire form of a single record: an 8-byte header followed by the key and
//! value bytes, packed with no padding.

use bytes::{Buf as _, BufMut};

/// `{ key_len: u32, value_len: u32 }`, little-endian.
pub(crate) const RECORD_HEADER_LEN: u32 = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct RecordHeader {
    pub key_len: u32,
    pub value_len: u32,
}

impl RecordHeader {
    pub fn encode(self) -> [u8; RECORD_HEADER_LEN as usize] {
        let mut buf = [0u8; RECORD_HEADER_LEN as usize];
        let mut cursor = &mut buf[..];
        cursor.put_u32_le(self.key_len);
        cursor.put_u32_le(self.value_len);
        buf
    }

    /// Decodes a header from `buf`, which must hold at least
    /// [`RECORD_HEADER_LEN`] bytes.
    pub fn decode(buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= RECORD_HEADER_LEN as usize);
        let mut cursor = buf;
        let key_len = cursor.get_u32_le();
        let value_len = cursor.get_u32_le();
        Self { key_len, value_len }
    }

    /// Total on-disk length of the record this header describes.
    pub fn record_len(self) -> u64 {
        u64::from(RECORD_HEADER_LEN) + u64::from(self.key_len) + u64::from(self.value_len)
    }
}

#[cfg(test)]
mod tests {
    use super::{RecordHeader, RECORD_HEADER_LEN};

    #[test]
    fn header_round_trips() {
        let header = RecordHeader {
            key_len: 3,
            value_len: 0x0001_0203,
        };
        let encoded = header.encode();
        assert_eq!(encoded.len(), RECORD_HEADER_LEN as usize);
        assert_eq!(RecordHeader::decode(&encoded), header);
    }

    #[test]
    fn header_is_little_endian() {
        let header = RecordHeader {
            key_len: 1,
            value_len: 0x0102,
        };
        assert_eq!(header.encode(), [1, 0, 0, 0, 2, 1, 0, 0]);
    }

    #[test]
    fn record_len_spans_header_key_and_value() {
        let header = RecordHeader {
            key_len: 4,
            value_len: 9,
        };
        assert_eq!(header.record_len(), 8 + 4 + 9);
    }
}
