//! Primitive wire reader and writer.
//!
//! Frames in this protocol carry no outer length prefix: payload layout is
//! defined entirely by the packet templates reading them. Writes therefore
//! assemble a complete frame in memory (so the connection can put it on the
//! stream atomically), while reads pull fields straight off the stream as
//! the owning template asks for them.

use crate::config::MAX_WIRE_LEN;
use crate::error::{NetError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Buffered writer for one outbound frame.
///
/// All integers are little-endian. Strings and byte arrays are prefixed
/// with their byte length as an i32.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the writer, yielding the finished frame.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.buf.put_u8(v);
        Ok(())
    }

    pub fn write_bool(&mut self, v: bool) -> Result<()> {
        self.buf.put_u8(u8::from(v));
        Ok(())
    }

    pub fn write_i16(&mut self, v: i16) -> Result<()> {
        self.buf.put_i16_le(v);
        Ok(())
    }

    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        self.buf.put_i32_le(v);
        Ok(())
    }

    pub fn write_i64(&mut self, v: i64) -> Result<()> {
        self.buf.put_i64_le(v);
        Ok(())
    }

    pub fn write_f32(&mut self, v: f32) -> Result<()> {
        self.buf.put_u32_le(v.to_bits());
        Ok(())
    }

    pub fn write_f64(&mut self, v: f64) -> Result<()> {
        self.buf.put_u64_le(v.to_bits());
        Ok(())
    }

    /// Write raw bytes with no length prefix.
    pub fn write_raw(&mut self, v: &[u8]) -> Result<()> {
        self.buf.put_slice(v);
        Ok(())
    }

    /// Write a length-prefixed byte array.
    pub fn write_bytes(&mut self, v: &[u8]) -> Result<()> {
        self.write_len(v.len())?;
        self.buf.put_slice(v);
        Ok(())
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, v: &str) -> Result<()> {
        self.write_bytes(v.as_bytes())
    }

    fn write_len(&mut self, len: usize) -> Result<()> {
        if len > MAX_WIRE_LEN {
            return Err(NetError::OversizedLength(len));
        }
        self.buf.put_i32_le(len as i32);
        Ok(())
    }
}

/// Sequential reader over an async byte stream.
///
/// Every length read off the wire is validated against `MAX_WIRE_LEN`
/// before allocating, so a hostile peer cannot force memory exhaustion
/// with one bogus prefix.
pub struct WireReader<'a> {
    inner: &'a mut (dyn AsyncRead + Send + Unpin),
}

impl<'a> WireReader<'a> {
    pub fn new(inner: &'a mut (dyn AsyncRead + Send + Unpin)) -> Self {
        Self { inner }
    }

    pub async fn read_u8(&mut self) -> Result<u8> {
        Ok(self.inner.read_u8().await?)
    }

    pub async fn read_bool(&mut self) -> Result<bool> {
        Ok(self.inner.read_u8().await? != 0)
    }

    pub async fn read_i16(&mut self) -> Result<i16> {
        let mut b = [0u8; 2];
        self.inner.read_exact(&mut b).await?;
        Ok(i16::from_le_bytes(b))
    }

    pub async fn read_i32(&mut self) -> Result<i32> {
        let mut b = [0u8; 4];
        self.inner.read_exact(&mut b).await?;
        Ok(i32::from_le_bytes(b))
    }

    pub async fn read_i64(&mut self) -> Result<i64> {
        let mut b = [0u8; 8];
        self.inner.read_exact(&mut b).await?;
        Ok(i64::from_le_bytes(b))
    }

    pub async fn read_f32(&mut self) -> Result<f32> {
        let mut b = [0u8; 4];
        self.inner.read_exact(&mut b).await?;
        Ok(f32::from_bits(u32::from_le_bytes(b)))
    }

    pub async fn read_f64(&mut self) -> Result<f64> {
        let mut b = [0u8; 8];
        self.inner.read_exact(&mut b).await?;
        Ok(f64::from_bits(u64::from_le_bytes(b)))
    }

    /// Read exactly `len` raw bytes.
    pub async fn read_raw(&mut self, len: usize) -> Result<Vec<u8>> {
        if len > MAX_WIRE_LEN {
            return Err(NetError::OversizedLength(len));
        }
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Read a length-prefixed byte array.
    pub async fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_len().await?;
        self.read_raw(len).await
    }

    /// Read a length-prefixed UTF-8 string.
    pub async fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes().await?;
        String::from_utf8(bytes).map_err(|e| NetError::Decode(format!("invalid UTF-8: {e}")))
    }

    /// Read and validate a length prefix.
    pub async fn read_len(&mut self) -> Result<usize> {
        let len = self.read_i32().await?;
        if len < 0 {
            return Err(NetError::Decode(format!("negative length prefix: {len}")));
        }
        let len = len as usize;
        if len > MAX_WIRE_LEN {
            return Err(NetError::OversizedLength(len));
        }
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn primitive_roundtrip() {
        let mut w = WireWriter::new();
        w.write_u8(0xAB).unwrap();
        w.write_bool(true).unwrap();
        w.write_bool(false).unwrap();
        w.write_i16(-1234).unwrap();
        w.write_i32(i32::MIN).unwrap();
        w.write_i64(i64::MAX).unwrap();
        w.write_f32(1.5).unwrap();
        w.write_f64(-2.25).unwrap();
        w.write_string("héllo").unwrap();
        w.write_bytes(&[1, 2, 3]).unwrap();

        let frame = w.into_bytes();
        let mut src: &[u8] = &frame;
        let mut r = WireReader::new(&mut src);

        assert_eq!(r.read_u8().await.unwrap(), 0xAB);
        assert!(r.read_bool().await.unwrap());
        assert!(!r.read_bool().await.unwrap());
        assert_eq!(r.read_i16().await.unwrap(), -1234);
        assert_eq!(r.read_i32().await.unwrap(), i32::MIN);
        assert_eq!(r.read_i64().await.unwrap(), i64::MAX);
        assert_eq!(r.read_f32().await.unwrap(), 1.5);
        assert_eq!(r.read_f64().await.unwrap(), -2.25);
        assert_eq!(r.read_string().await.unwrap(), "héllo");
        assert_eq!(r.read_bytes().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn negative_length_rejected() {
        let mut w = WireWriter::new();
        w.write_i32(-5).unwrap();
        let frame = w.into_bytes();
        let mut src: &[u8] = &frame;
        let mut r = WireReader::new(&mut src);
        assert!(matches!(
            r.read_string().await,
            Err(NetError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn oversized_length_rejected_before_allocation() {
        let mut w = WireWriter::new();
        w.write_i32((MAX_WIRE_LEN as i32).saturating_add(1)).unwrap();
        let frame = w.into_bytes();
        let mut src: &[u8] = &frame;
        let mut r = WireReader::new(&mut src);
        assert!(matches!(
            r.read_bytes().await,
            Err(NetError::OversizedLength(_))
        ));
    }

    #[tokio::test]
    async fn truncated_stream_is_io_error() {
        let mut w = WireWriter::new();
        w.write_string("truncate me").unwrap();
        let frame = w.into_bytes();
        let mut src: &[u8] = &frame[..frame.len() - 2];
        let mut r = WireReader::new(&mut src);
        assert!(matches!(r.read_string().await, Err(NetError::Io(_))));
    }
}
