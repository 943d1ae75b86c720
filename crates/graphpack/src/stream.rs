//! Var-int byte stream layer.
//!
//! [`WireEncoder`] and [`WireDecoder`] wrap any sequential byte stream
//! ([`std::io::Write`] / [`std::io::Read`]) with the primitive operations
//! every other component is written against:
//!
//! - Fixed-width integers and floats pass through in little-endian order.
//! - Length-like 32-bit values use 7-bit var-int encoding (LSB first,
//!   continuation bit in the MSB), so small counts stay compact.
//! - Strings are var-int byte-length prefixed UTF-8.
//! - Object and type ids use the shared width policy: unsigned 16-bit
//!   while the governing count fits, signed 32-bit beyond that.
//!
//! A read hitting end-of-stream mid-value fails with
//! [`Error::Truncated`](crate::error::Error::Truncated).

use std::io::{Read, Write};

use crate::error::{Error, Result};

/// Returns whether ids governed by `count` need the wide (i32) encoding.
#[inline]
pub(crate) const fn needs_wide_index(count: u32) -> bool {
    count > u16::MAX as u32
}

// =============================================================================
// WireEncoder
// =============================================================================

/// Encoder half of the wire format, writing to any [`Write`]
/// implementation.
#[derive(Debug)]
pub struct WireEncoder<W> {
    writer: W,
}

impl<W> WireEncoder<W> {
    /// Creates a new encoder wrapping the given writer.
    #[must_use]
    pub const fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Returns a reference to the underlying writer.
    #[must_use]
    pub const fn get_ref(&self) -> &W {
        &self.writer
    }

    /// Returns a mutable reference to the underlying writer.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Consumes the encoder and returns the underlying writer.
    #[must_use]
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> WireEncoder<W> {
    #[inline]
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes).map_err(Error::from_io)
    }

    /// Emits a single unsigned byte.
    pub fn emit_u8(&mut self, v: u8) -> Result<()> {
        self.write_all(&[v])
    }

    /// Emits a 16-bit unsigned integer, little-endian.
    pub fn emit_u16(&mut self, v: u16) -> Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    /// Emits a 32-bit unsigned integer, little-endian.
    pub fn emit_u32(&mut self, v: u32) -> Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    /// Emits a 64-bit unsigned integer, little-endian.
    pub fn emit_u64(&mut self, v: u64) -> Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    /// Emits a single signed byte.
    pub fn emit_i8(&mut self, v: i8) -> Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    /// Emits a 16-bit signed integer, little-endian.
    pub fn emit_i16(&mut self, v: i16) -> Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    /// Emits a 32-bit signed integer, little-endian.
    pub fn emit_i32(&mut self, v: i32) -> Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    /// Emits a 64-bit signed integer, little-endian.
    pub fn emit_i64(&mut self, v: i64) -> Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    /// Emits a 32-bit float, IEEE 754 little-endian.
    pub fn emit_f32(&mut self, v: f32) -> Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    /// Emits a 64-bit float, IEEE 754 little-endian.
    pub fn emit_f64(&mut self, v: f64) -> Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    /// Emits a boolean as a single byte, `1` for true.
    pub fn emit_bool(&mut self, v: bool) -> Result<()> {
        self.emit_u8(u8::from(v))
    }

    /// Emits a 7-bit var-int encoded unsigned 32-bit integer: seven data
    /// bits per byte, LSB first, continuation bit in the MSB.
    #[allow(clippy::cast_possible_truncation)]
    pub fn emit_var_u32(&mut self, mut v: u32) -> Result<()> {
        // A u32 never takes more than five bytes.
        let mut buf = [0u8; 5];
        let mut used = 0;
        while v >= 0x80 {
            buf[used] = (v as u8) | 0x80;
            v >>= 7;
            used += 1;
        }
        buf[used] = v as u8;
        self.write_all(&buf[..=used])
    }

    /// Emits a signed 32-bit integer through the var-int encoding of its
    /// bit pattern, so `-1` occupies the full five bytes.
    #[allow(clippy::cast_sign_loss)]
    pub fn emit_var_i32(&mut self, v: i32) -> Result<()> {
        self.emit_var_u32(v as u32)
    }

    /// Emits a string as a var-int byte length followed by UTF-8 bytes.
    pub fn emit_str(&mut self, v: &str) -> Result<()> {
        let len = u32::try_from(v.len())
            .map_err(|_| Error::malformed("string length exceeds u32"))?;
        self.emit_var_u32(len)?;
        self.write_all(v.as_bytes())
    }

    /// Emits raw bytes directly to the output.
    pub fn emit_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_all(bytes)
    }

    /// Emits an object or type id under the shared width policy.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn emit_index(&mut self, v: u32, wide: bool) -> Result<()> {
        if wide {
            self.emit_i32(v as i32)
        } else {
            debug_assert!(v <= u32::from(u16::MAX));
            self.emit_u16(v as u16)
        }
    }
}

// =============================================================================
// WireDecoder
// =============================================================================

/// Decoder half of the wire format, reading from any [`Read`]
/// implementation.
#[derive(Debug)]
pub struct WireDecoder<R> {
    reader: R,
}

impl<R> WireDecoder<R> {
    /// Creates a new decoder wrapping the given reader.
    #[must_use]
    pub const fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Returns a reference to the underlying reader.
    #[must_use]
    pub const fn get_ref(&self) -> &R {
        &self.reader
    }

    /// Returns a mutable reference to the underlying reader.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Consumes the decoder and returns the underlying reader.
    #[must_use]
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read> WireDecoder<R> {
    #[inline]
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.reader.read_exact(buf).map_err(Error::from_io)
    }

    /// Reads a single unsigned byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    /// Reads a 16-bit unsigned integer, little-endian.
    pub fn read_u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Reads a 32-bit unsigned integer, little-endian.
    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Reads a 64-bit unsigned integer, little-endian.
    pub fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads a single signed byte.
    pub fn read_i8(&mut self) -> Result<i8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(i8::from_le_bytes(buf))
    }

    /// Reads a 16-bit signed integer, little-endian.
    pub fn read_i16(&mut self) -> Result<i16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(i16::from_le_bytes(buf))
    }

    /// Reads a 32-bit signed integer, little-endian.
    pub fn read_i32(&mut self) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    /// Reads a 64-bit signed integer, little-endian.
    pub fn read_i64(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    /// Reads a 32-bit float, IEEE 754 little-endian.
    pub fn read_f32(&mut self) -> Result<f32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(f32::from_le_bytes(buf))
    }

    /// Reads a 64-bit float, IEEE 754 little-endian.
    pub fn read_f64(&mut self) -> Result<f64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(f64::from_le_bytes(buf))
    }

    /// Reads a boolean; any non-zero byte is `true`.
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a 7-bit var-int encoded unsigned 32-bit integer.
    pub fn read_var_u32(&mut self) -> Result<u32> {
        let mut result: u32 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            if shift >= 32 {
                return Err(Error::malformed("var-int too long for u32"));
            }
            result |= u32::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    /// Reads a signed 32-bit integer encoded as the var-int of its bit
    /// pattern.
    #[allow(clippy::cast_possible_wrap)]
    pub fn read_var_i32(&mut self) -> Result<i32> {
        Ok(self.read_var_u32()? as i32)
    }

    /// Reads a var-int length-prefixed UTF-8 string.
    pub fn read_str(&mut self) -> Result<String> {
        let len = self.read_var_u32()? as usize;
        let bytes = self.read_raw(len)?;
        String::from_utf8(bytes)
            .map_err(|_| Error::malformed("invalid UTF-8 in string"))
    }

    /// Reads exactly `len` raw bytes into an owned vector.
    pub fn read_raw(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Reads raw bytes until the pre-sized buffer is full.
    pub fn read_raw_into(&mut self, buf: &mut [u8]) -> Result<()> {
        self.read_exact(buf)
    }

    /// Reads an object or type id under the shared width policy.
    #[allow(clippy::cast_sign_loss)]
    pub fn read_index(&mut self, wide: bool) -> Result<u32> {
        if wide {
            let v = self.read_i32()?;
            if v < 0 {
                return Err(Error::malformed("negative id in stream"));
            }
            Ok(v as u32)
        } else {
            Ok(u32::from(self.read_u16()?))
        }
    }
}
