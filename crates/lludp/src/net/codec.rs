//! Big-endian field readers and writers plus payload zero-coding.
//!
//! Every fixed-size read is bounds-checked and reports
//! [`ProtocolError::InsufficientData`] instead of panicking, so a truncated
//! datagram can never cause an out-of-bounds access.

use glam::{Quat, Vec3};
use uuid::Uuid;

use super::error::ProtocolError;

pub const MAX_SHORT_STRING: usize = u8::MAX as usize;
pub const MAX_LONG_STRING: usize = u16::MAX as usize;

pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < len {
            return Err(ProtocolError::InsufficientData {
                needed: len,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, ProtocolError> {
        Ok(f32::from_be_bytes(self.take_array()?))
    }

    pub fn read_vec3(&mut self) -> Result<Vec3, ProtocolError> {
        let x = self.read_f32()?;
        let y = self.read_f32()?;
        let z = self.read_f32()?;
        Ok(Vec3::new(x, y, z))
    }

    /// Quaternions travel as x, y, z, w.
    pub fn read_quat(&mut self) -> Result<Quat, ProtocolError> {
        let x = self.read_f32()?;
        let y = self.read_f32()?;
        let z = self.read_f32()?;
        let w = self.read_f32()?;
        Ok(Quat::from_xyzw(x, y, z, w))
    }

    pub fn read_uuid(&mut self) -> Result<Uuid, ProtocolError> {
        Ok(Uuid::from_bytes(self.take_array()?))
    }

    pub fn read_short_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_u8()? as usize;
        self.read_utf8(len)
    }

    pub fn read_long_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_u16()? as usize;
        self.read_utf8(len)
    }

    fn read_utf8(&mut self, len: usize) -> Result<String, ProtocolError> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidString)
    }

    pub fn read_u32_list(&mut self) -> Result<Vec<u32>, ProtocolError> {
        let count = self.read_u8()? as usize;
        (0..count).map(|_| self.read_u32()).collect()
    }
}

#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_vec3(&mut self, value: Vec3) {
        self.write_f32(value.x);
        self.write_f32(value.y);
        self.write_f32(value.z);
    }

    pub fn write_quat(&mut self, value: Quat) {
        self.write_f32(value.x);
        self.write_f32(value.y);
        self.write_f32(value.z);
        self.write_f32(value.w);
    }

    pub fn write_uuid(&mut self, value: &Uuid) {
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn write_short_string(&mut self, value: &str) -> Result<(), ProtocolError> {
        let len = checked_len(value, MAX_SHORT_STRING)?;
        self.write_u8(len as u8);
        self.buf.extend_from_slice(value.as_bytes());
        Ok(())
    }

    pub fn write_long_string(&mut self, value: &str) -> Result<(), ProtocolError> {
        let len = checked_len(value, MAX_LONG_STRING)?;
        self.write_u16(len as u16);
        self.buf.extend_from_slice(value.as_bytes());
        Ok(())
    }

    pub fn write_u32_list(&mut self, values: &[u32]) -> Result<(), ProtocolError> {
        if values.len() > u8::MAX as usize {
            return Err(ProtocolError::TooManyAcks(values.len()));
        }
        self.write_u8(values.len() as u8);
        for value in values {
            self.write_u32(*value);
        }
        Ok(())
    }
}

fn checked_len(value: &str, max: usize) -> Result<usize, ProtocolError> {
    let len = value.len();
    if len > max {
        return Err(ProtocolError::StringTooLong { len, max });
    }
    Ok(len)
}

/// Collapses each run of up to 255 zero bytes into `0x00, run_length`.
pub fn zero_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] != 0 {
            out.push(data[i]);
            i += 1;
            continue;
        }

        let mut run = 0usize;
        while i < data.len() && data[i] == 0 && run < u8::MAX as usize {
            run += 1;
            i += 1;
        }
        out.push(0);
        out.push(run as u8);
    }
    out
}

pub fn zero_decode(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(data.len() * 2);
    let mut iter = data.iter();
    while let Some(&byte) = iter.next() {
        if byte != 0 {
            out.push(byte);
            continue;
        }
        let run = *iter.next().ok_or(ProtocolError::InvalidZerocode)?;
        if run == 0 {
            return Err(ProtocolError::InvalidZerocode);
        }
        out.resize(out.len() + run as usize, 0);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_reports_insufficient_data() {
        let mut reader = WireReader::new(&[0, 1]);
        assert_eq!(
            reader.read_u32(),
            Err(ProtocolError::InsufficientData {
                needed: 4,
                available: 2
            })
        );
    }

    #[test]
    fn test_big_endian_layout() {
        let mut writer = WireWriter::new();
        writer.write_u32(0x0102_0304);
        writer.write_f32(1.0);
        assert_eq!(writer.into_inner(), vec![1, 2, 3, 4, 0x3f, 0x80, 0, 0]);
    }

    #[test]
    fn test_string_prefixes() {
        let mut writer = WireWriter::new();
        writer.write_short_string("hi").unwrap();
        writer.write_long_string("yo").unwrap();
        let bytes = writer.into_inner();
        assert_eq!(bytes, vec![2, b'h', b'i', 0, 2, b'y', b'o']);

        let mut reader = WireReader::new(&bytes);
        assert_eq!(reader.read_short_string().unwrap(), "hi");
        assert_eq!(reader.read_long_string().unwrap(), "yo");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_short_string_limit() {
        let mut writer = WireWriter::new();
        let long = "x".repeat(256);
        assert_eq!(
            writer.write_short_string(&long),
            Err(ProtocolError::StringTooLong { len: 256, max: 255 })
        );
    }

    #[test]
    fn test_truncated_string_body() {
        let mut reader = WireReader::new(&[5, b'a', b'b']);
        assert!(matches!(
            reader.read_short_string(),
            Err(ProtocolError::InsufficientData { needed: 5, .. })
        ));
    }

    #[test]
    fn test_zerocode_runs() {
        let data = [1, 0, 0, 0, 2, 0];
        let encoded = zero_encode(&data);
        assert_eq!(encoded, vec![1, 0, 3, 2, 0, 1]);
        assert_eq!(zero_decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_zerocode_long_run_splits() {
        let data = vec![0u8; 300];
        let encoded = zero_encode(&data);
        assert_eq!(encoded, vec![0, 255, 0, 45]);
        assert_eq!(zero_decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_zerocode_rejects_dangling_zero() {
        assert_eq!(zero_decode(&[7, 0]), Err(ProtocolError::InvalidZerocode));
    }
}
