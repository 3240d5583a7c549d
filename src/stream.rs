//! Byte-order-aware read/seek primitives
//!
//! Both the TIFF IFD codec and the box framing code read multi-byte integers
//! from a random-access stream. The byte order is decided once, when the
//! stream is opened: from the `II`/`MM` marker for TIFF, always big-endian
//! for JP2 box framing. Reads advance the stream cursor by exactly the
//! requested span and never buffer beyond it.

use crate::error::{Error, Result};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Seek, Write};

/// Byte order for multi-byte reads, fixed per stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    LittleEndian,
    BigEndian,
}

impl Endian {
    pub fn read_u16<R: Read>(&self, reader: &mut R) -> Result<u16> {
        Ok(match self {
            Endian::LittleEndian => reader.read_u16::<LittleEndian>()?,
            Endian::BigEndian => reader.read_u16::<BigEndian>()?,
        })
    }

    pub fn read_u32<R: Read>(&self, reader: &mut R) -> Result<u32> {
        Ok(match self {
            Endian::LittleEndian => reader.read_u32::<LittleEndian>()?,
            Endian::BigEndian => reader.read_u32::<BigEndian>()?,
        })
    }

    pub fn read_u64<R: Read>(&self, reader: &mut R) -> Result<u64> {
        Ok(match self {
            Endian::LittleEndian => reader.read_u64::<LittleEndian>()?,
            Endian::BigEndian => reader.read_u64::<BigEndian>()?,
        })
    }

    pub fn read_i16<R: Read>(&self, reader: &mut R) -> Result<i16> {
        Ok(match self {
            Endian::LittleEndian => reader.read_i16::<LittleEndian>()?,
            Endian::BigEndian => reader.read_i16::<BigEndian>()?,
        })
    }

    pub fn read_i32<R: Read>(&self, reader: &mut R) -> Result<i32> {
        Ok(match self {
            Endian::LittleEndian => reader.read_i32::<LittleEndian>()?,
            Endian::BigEndian => reader.read_i32::<BigEndian>()?,
        })
    }

    pub fn read_i64<R: Read>(&self, reader: &mut R) -> Result<i64> {
        Ok(match self {
            Endian::LittleEndian => reader.read_i64::<LittleEndian>()?,
            Endian::BigEndian => reader.read_i64::<BigEndian>()?,
        })
    }

    pub fn read_f32<R: Read>(&self, reader: &mut R) -> Result<f32> {
        Ok(match self {
            Endian::LittleEndian => reader.read_f32::<LittleEndian>()?,
            Endian::BigEndian => reader.read_f32::<BigEndian>()?,
        })
    }

    pub fn read_f64<R: Read>(&self, reader: &mut R) -> Result<f64> {
        Ok(match self {
            Endian::LittleEndian => reader.read_f64::<LittleEndian>()?,
            Endian::BigEndian => reader.read_f64::<BigEndian>()?,
        })
    }

    pub fn write_u16<W: Write>(&self, writer: &mut W, value: u16) -> Result<()> {
        match self {
            Endian::LittleEndian => writer.write_u16::<LittleEndian>(value)?,
            Endian::BigEndian => writer.write_u16::<BigEndian>(value)?,
        }
        Ok(())
    }

    pub fn write_u32<W: Write>(&self, writer: &mut W, value: u32) -> Result<()> {
        match self {
            Endian::LittleEndian => writer.write_u32::<LittleEndian>(value)?,
            Endian::BigEndian => writer.write_u32::<BigEndian>(value)?,
        }
        Ok(())
    }

    pub fn write_u64<W: Write>(&self, writer: &mut W, value: u64) -> Result<()> {
        match self {
            Endian::LittleEndian => writer.write_u64::<LittleEndian>(value)?,
            Endian::BigEndian => writer.write_u64::<BigEndian>(value)?,
        }
        Ok(())
    }
}

/// Read exactly `n` bytes, advancing the cursor by `n`
///
/// A short read fails with [`Error::Truncated`] carrying the position at
/// which the read started and how much was actually obtained.
pub fn read_exact<R: Read + Seek>(reader: &mut R, n: usize) -> Result<Vec<u8>> {
    let offset = reader.stream_position()?;
    let mut buf = vec![0u8; n];
    let mut got = 0;
    while got < n {
        match reader.read(&mut buf[got..]) {
            Ok(0) => {
                return Err(Error::Truncated {
                    offset,
                    wanted: n,
                    got,
                })
            }
            Ok(k) => got += k,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_endian_reads() {
        let be = Endian::BigEndian;
        let le = Endian::LittleEndian;

        let mut c = Cursor::new(vec![0x12, 0x34]);
        assert_eq!(be.read_u16(&mut c).unwrap(), 0x1234);
        c.set_position(0);
        assert_eq!(le.read_u16(&mut c).unwrap(), 0x3412);

        let mut c = Cursor::new(vec![0x12, 0x34, 0x56, 0x78]);
        assert_eq!(be.read_u32(&mut c).unwrap(), 0x12345678);
        c.set_position(0);
        assert_eq!(le.read_u32(&mut c).unwrap(), 0x78563412);
    }

    #[test]
    fn test_truncated_read_reports_position() {
        let mut c = Cursor::new(vec![0u8; 10]);
        c.set_position(4);
        let err = read_exact(&mut c, 10).unwrap_err();
        match err {
            Error::Truncated { offset, wanted, got } => {
                assert_eq!(offset, 4);
                assert_eq!(wanted, 10);
                assert_eq!(got, 6);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
