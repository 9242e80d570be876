//! Byte payloads with typed, big-endian read/write helpers.
//!
//! Every [`Message`](crate::Message) carries a `Packet`. Writers append
//! values in network byte order; readers consume them from a cursor in the
//! same order. A read past the end fails with
//! [`PacketError::Truncated`] and leaves the cursor where it was.

use crate::PacketError;

/// A growable byte buffer with a read cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    data: Vec<u8>,
    read_pos: usize,
}

impl Packet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps existing bytes; the read cursor starts at the beginning.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data, read_pos: 0 }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes not yet consumed by a read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.read_pos
    }

    /// `true` once every byte has been read.
    pub fn is_exhausted(&self) -> bool {
        self.read_pos >= self.data.len()
    }

    /// Moves the read cursor back to the start.
    pub fn rewind(&mut self) {
        self.read_pos = 0;
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.read_pos = 0;
    }

    // -- Writers ----------------------------------------------------------

    pub fn write_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.extend_from_slice(bytes);
        self
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.data.push(value);
        self
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.write_u8(u8::from(value))
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.write_raw(&value.to_be_bytes())
    }

    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.write_raw(&value.to_be_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.write_raw(&value.to_be_bytes())
    }

    pub fn write_i64(&mut self, value: i64) -> &mut Self {
        self.write_raw(&value.to_be_bytes())
    }

    pub fn write_f32(&mut self, value: f32) -> &mut Self {
        self.write_raw(&value.to_bits().to_be_bytes())
    }

    /// Writes a `u32` length followed by the bytes.
    pub fn write_blob(&mut self, bytes: &[u8]) -> &mut Self {
        self.write_u32(bytes.len() as u32);
        self.write_raw(bytes)
    }

    /// Writes a `u32` byte length followed by the UTF-8 bytes.
    pub fn write_str(&mut self, value: &str) -> &mut Self {
        self.write_blob(value.as_bytes())
    }

    // -- Readers ----------------------------------------------------------

    fn take(&mut self, count: usize) -> Result<&[u8], PacketError> {
        if count > self.remaining() {
            return Err(PacketError::Truncated {
                needed: count,
                remaining: self.remaining(),
            });
        }
        let start = self.read_pos;
        self.read_pos += count;
        Ok(&self.data[start..start + count])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], PacketError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, PacketError> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, PacketError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u32(&mut self) -> Result<u32, PacketError> {
        self.take_array().map(u32::from_be_bytes)
    }

    pub fn read_i32(&mut self) -> Result<i32, PacketError> {
        self.take_array().map(i32::from_be_bytes)
    }

    pub fn read_u64(&mut self) -> Result<u64, PacketError> {
        self.take_array().map(u64::from_be_bytes)
    }

    pub fn read_i64(&mut self) -> Result<i64, PacketError> {
        self.take_array().map(i64::from_be_bytes)
    }

    pub fn read_f32(&mut self) -> Result<f32, PacketError> {
        self.take_array()
            .map(|bytes| f32::from_bits(u32::from_be_bytes(bytes)))
    }

    /// Reads a `u32`-length-prefixed byte blob.
    ///
    /// On a truncated body the cursor is restored to before the length.
    pub fn read_blob(&mut self) -> Result<Vec<u8>, PacketError> {
        let mark = self.read_pos;
        let len = self.read_u32()? as usize;
        let body = self.take(len).map(<[u8]>::to_vec);
        if body.is_err() {
            self.read_pos = mark;
        }
        body
    }

    pub fn read_string(&mut self) -> Result<String, PacketError> {
        let bytes = self.read_blob()?;
        String::from_utf8(bytes).map_err(|_| PacketError::InvalidUtf8)
    }

    /// Consumes everything left after the cursor.
    pub fn read_rest(&mut self) -> Vec<u8> {
        let rest = self.data[self.read_pos..].to_vec();
        self.read_pos = self.data.len();
        rest
    }
}

impl From<Vec<u8>> for Packet {
    fn from(data: Vec<u8>) -> Self {
        Self::from_bytes(data)
    }
}
