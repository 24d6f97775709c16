use byteorder::{BigEndian, ByteOrder};

/// Appends big-endian fields to a byte buffer and patches them later by
/// offset. Every `put_*` returns the offset it wrote at.
#[derive(Clone, Debug, Default)]
pub struct PacketBuilder {
    buf: Vec<u8>,
}

impl PacketBuilder {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, value: u8) -> usize {
        let offset = self.buf.len();
        self.buf.push(value);
        offset
    }

    pub fn put_u16(&mut self, value: u16) -> usize {
        self.put_bytes(&value.to_be_bytes())
    }

    pub fn put_u32(&mut self, value: u32) -> usize {
        self.put_bytes(&value.to_be_bytes())
    }

    pub fn put_u64(&mut self, value: u64) -> usize {
        self.put_bytes(&value.to_be_bytes())
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> usize {
        let offset = self.buf.len();
        self.buf.extend_from_slice(bytes);
        offset
    }

    pub fn put_zeros(&mut self, count: usize) -> usize {
        let offset = self.buf.len();
        self.buf.resize(offset + count, 0);
        offset
    }

    pub fn patch_u16(&mut self, offset: usize, value: u16) {
        BigEndian::write_u16(&mut self.buf[offset..offset + 2], value);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}
