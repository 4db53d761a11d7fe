//! Minimal growable byte buffer.
//!
//! Enough for [`super::TcpServer`]'s handlers to assemble and parse
//! fixed-width fields without pulling in a framing crate; not a general
//! codec.

/// A growable `Vec<u8>` with a read cursor and big/little-endian helpers.
#[derive(Debug, Default, Clone)]
pub struct ByteArray {
    buf: Vec<u8>,
    pos: usize,
}

macro_rules! rw_int {
    ($ty:ty, $write_be:ident, $write_le:ident, $read_be:ident, $read_le:ident) => {
        pub fn $write_be(&mut self, v: $ty) {
            self.buf.extend_from_slice(&v.to_be_bytes());
        }

        pub fn $write_le(&mut self, v: $ty) {
            self.buf.extend_from_slice(&v.to_le_bytes());
        }

        pub fn $read_be(&mut self) -> Option<$ty> {
            self.take(std::mem::size_of::<$ty>())
                .map(|b| <$ty>::from_be_bytes(b.try_into().unwrap()))
        }

        pub fn $read_le(&mut self) -> Option<$ty> {
            self.take(std::mem::size_of::<$ty>())
                .map(|b| <$ty>::from_le_bytes(b.try_into().unwrap()))
        }
    };
}

impl ByteArray {
    pub fn new() -> Self {
        ByteArray::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        ByteArray {
            buf: Vec::with_capacity(cap),
            pos: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes still unread ahead of the cursor.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    rw_int!(u16, write_u16_be, write_u16_le, read_u16_be, read_u16_le);
    rw_int!(u32, write_u32_be, write_u32_le, read_u32_be, read_u32_le);
    rw_int!(u64, write_u64_be, write_u64_le, read_u64_be, read_u64_le);

    fn take(&mut self, n: usize) -> Option<Vec<u8>> {
        if self.remaining() < n {
            return None;
        }
        let slice = self.buf[self.pos..self.pos + n].to_vec();
        self.pos += n;
        Some(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_big_endian_integers() {
        let mut b = ByteArray::new();
        b.write_u32_be(0xdead_beef);
        b.write_u16_be(42);
        assert_eq!(b.read_u32_be(), Some(0xdead_beef));
        assert_eq!(b.read_u16_be(), Some(42));
        assert_eq!(b.read_u8(), None);
    }

    #[test]
    fn round_trips_little_endian_integers() {
        let mut b = ByteArray::new();
        b.write_u64_le(0x0102_0304_0506_0708);
        assert_eq!(b.read_u64_le(), Some(0x0102_0304_0506_0708));
    }

    #[test]
    fn short_read_returns_none_without_advancing() {
        let mut b = ByteArray::new();
        b.write_u8(1);
        assert_eq!(b.read_u32_be(), None);
        assert_eq!(b.position(), 0);
        assert_eq!(b.read_u8(), Some(1));
    }
}
