//! Typed pack/unpack session buffers.
//!
//! The send buffer packs fixed-width little-endian values back to back; the
//! receive buffer unpacks them in order and compacts itself once fully
//! drained. Growth is checked so allocation failure surfaces as an error
//! instead of an abort.

use crate::error::{Result, SessionError};

const DEFAULT_CAPACITY: usize = 4096;

fn grow(buf: &mut Vec<u8>, additional: usize) -> Result<()> {
    buf.try_reserve(additional)
        .map_err(|err| SessionError::ResourceExhausted(format!("session buffer: {err}")))
}

/// Growable send-side pack buffer.
#[derive(Debug)]
pub struct PackBuffer {
    buf: Vec<u8>,
}

impl Default for PackBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PackBuffer {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(DEFAULT_CAPACITY),
        }
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn pack_bytes(&mut self, data: &[u8]) -> Result<()> {
        grow(&mut self.buf, data.len())?;
        self.buf.extend_from_slice(data);
        Ok(())
    }

    pub fn pack_i16(&mut self, values: &[i16]) -> Result<()> {
        grow(&mut self.buf, values.len() * 2)?;
        for v in values {
            self.buf.extend_from_slice(&v.to_le_bytes());
        }
        Ok(())
    }

    pub fn pack_i32(&mut self, values: &[i32]) -> Result<()> {
        grow(&mut self.buf, values.len() * 4)?;
        for v in values {
            self.buf.extend_from_slice(&v.to_le_bytes());
        }
        Ok(())
    }

    pub fn pack_u32(&mut self, values: &[u32]) -> Result<()> {
        grow(&mut self.buf, values.len() * 4)?;
        for v in values {
            self.buf.extend_from_slice(&v.to_le_bytes());
        }
        Ok(())
    }

    pub fn pack_i64(&mut self, values: &[i64]) -> Result<()> {
        grow(&mut self.buf, values.len() * 8)?;
        for v in values {
            self.buf.extend_from_slice(&v.to_le_bytes());
        }
        Ok(())
    }
}

/// Receive-side unpack buffer with an advancing read offset.
#[derive(Debug, Default)]
pub struct UnpackBuffer {
    buf: Vec<u8>,
    offset: usize,
}

impl UnpackBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a received payload behind any unconsumed bytes.
    pub fn load(&mut self, data: &[u8]) -> Result<()> {
        grow(&mut self.buf, data.len())?;
        self.buf.extend_from_slice(data);
        Ok(())
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.offset = 0;
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    fn take(&mut self, len: usize) -> Result<&[u8]> {
        if self.remaining() < len {
            return Err(SessionError::Protocol(format!(
                "unpack of {len} bytes with only {} available",
                self.remaining()
            )));
        }
        let start = self.offset;
        self.offset += len;
        Ok(&self.buf[start..start + len])
    }

    /// Drop consumed bytes once the buffer is fully drained.
    fn compact(&mut self) {
        if self.offset == self.buf.len() {
            self.buf.clear();
            self.offset = 0;
        }
    }

    pub fn unpack_bytes(&mut self, out: &mut [u8]) -> Result<()> {
        let data = self.take(out.len())?;
        out.copy_from_slice(data);
        self.compact();
        Ok(())
    }

    pub fn unpack_i16(&mut self, out: &mut [i16]) -> Result<()> {
        for slot in out.iter_mut() {
            let data = self.take(2)?;
            *slot = i16::from_le_bytes([data[0], data[1]]);
        }
        self.compact();
        Ok(())
    }

    pub fn unpack_i32(&mut self, out: &mut [i32]) -> Result<()> {
        for slot in out.iter_mut() {
            let data = self.take(4)?;
            *slot = i32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        }
        self.compact();
        Ok(())
    }

    pub fn unpack_i64(&mut self, out: &mut [i64]) -> Result<()> {
        for slot in out.iter_mut() {
            let data = self.take(8)?;
            *slot = i64::from_le_bytes([
                data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
            ]);
        }
        self.compact();
        Ok(())
    }

    pub fn unpack_one_i32(&mut self) -> Result<i32> {
        let mut out = [0i32];
        self.unpack_i32(&mut out)?;
        Ok(out[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        let mut pack = PackBuffer::new();
        pack.pack_i32(&[7, -2]).unwrap();
        pack.pack_i16(&[300]).unwrap();
        pack.pack_i64(&[1 << 40]).unwrap();
        pack.pack_bytes(b"tail").unwrap();

        let mut unpack = UnpackBuffer::new();
        unpack.load(pack.as_slice()).unwrap();

        let mut ints = [0i32; 2];
        unpack.unpack_i32(&mut ints).unwrap();
        assert_eq!(ints, [7, -2]);

        let mut shorts = [0i16; 1];
        unpack.unpack_i16(&mut shorts).unwrap();
        assert_eq!(shorts, [300]);

        let mut longs = [0i64; 1];
        unpack.unpack_i64(&mut longs).unwrap();
        assert_eq!(longs, [1 << 40]);

        let mut tail = [0u8; 4];
        unpack.unpack_bytes(&mut tail).unwrap();
        assert_eq!(&tail, b"tail");

        // fully drained buffers compact back to empty
        assert_eq!(unpack.remaining(), 0);
        assert!(unpack.buf.is_empty());
    }

    #[test]
    fn unpack_past_end_is_an_error() {
        let mut unpack = UnpackBuffer::new();
        unpack.load(&[1, 2, 3]).unwrap();
        let mut out = [0i32];
        assert!(unpack.unpack_i32(&mut out).is_err());
    }

    #[test]
    fn partial_drain_keeps_unconsumed_bytes() {
        let mut unpack = UnpackBuffer::new();
        unpack.load(&5i32.to_le_bytes()).unwrap();
        unpack.load(&6i32.to_le_bytes()).unwrap();

        assert_eq!(unpack.unpack_one_i32().unwrap(), 5);
        assert_eq!(unpack.remaining(), 4);
        assert_eq!(unpack.unpack_one_i32().unwrap(), 6);
        assert_eq!(unpack.remaining(), 0);
    }

    #[test]
    fn send_buffer_reset_clears_content() {
        let mut pack = PackBuffer::new();
        pack.pack_bytes(&[9; 128]).unwrap();
        assert_eq!(pack.len(), 128);
        pack.reset();
        assert!(pack.is_empty());
    }
}
