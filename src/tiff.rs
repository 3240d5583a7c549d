//! TIFF/BigTIFF IFD codec
//!
//! This module reads and writes the Image File Directory structure that
//! carries TIFF and EXIF metadata:
//! - Reading supports both classic TIFF (12-byte entries, 4-byte offsets)
//!   and BigTIFF (20-byte entries, 8-byte offsets), either byte order.
//! - Writing always emits the classic little-endian layout, which is what
//!   goes into an EXIF or GeoTIFF UUID box.
//!
//! IFD structure:
//! - Header: byte order (II/MM), version (42 classic / 43 BigTIFF), offset
//!   to the first IFD
//! - IFD: entry count, fixed-size entry table, out-of-line payload region
//! - Entry: tag ID, datatype, count, inline value or payload offset

use crate::error::{Error, Result};
use crate::stream::{read_exact, Endian};
use byteorder::{LittleEndian, WriteBytesExt};
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

/// TIFF/EXIF tag IDs
pub mod tags {
    pub const IMAGE_WIDTH: u16 = 256;
    pub const IMAGE_LENGTH: u16 = 257;
    pub const BITS_PER_SAMPLE: u16 = 258;
    pub const COMPRESSION: u16 = 259;
    pub const PHOTOMETRIC_INTERPRETATION: u16 = 262;
    pub const MAKE: u16 = 271;
    pub const MODEL: u16 = 272;
    pub const STRIP_OFFSETS: u16 = 273;
    pub const ORIENTATION: u16 = 274;
    pub const SAMPLES_PER_PIXEL: u16 = 277;
    pub const ROWS_PER_STRIP: u16 = 278;
    pub const STRIP_BYTE_COUNTS: u16 = 279;
    pub const X_RESOLUTION: u16 = 282;
    pub const Y_RESOLUTION: u16 = 283;
    pub const PLANAR_CONFIGURATION: u16 = 284;
    pub const RESOLUTION_UNIT: u16 = 296;
    pub const SOFTWARE: u16 = 305;
    pub const DATE_TIME: u16 = 306;
    pub const ARTIST: u16 = 315;
    pub const PREDICTOR: u16 = 317;
    pub const TILE_WIDTH: u16 = 322;
    pub const TILE_LENGTH: u16 = 323;
    pub const TILE_OFFSETS: u16 = 324;
    pub const TILE_BYTE_COUNTS: u16 = 325;
    pub const SAMPLE_FORMAT: u16 = 339;
    pub const JPEG_TABLES: u16 = 347;
    pub const XML_PACKET: u16 = 700;
    pub const COPYRIGHT: u16 = 33432;
    pub const MODEL_PIXEL_SCALE: u16 = 33550;
    pub const MODEL_TIE_POINT: u16 = 33922;
    pub const MODEL_TRANSFORMATION: u16 = 34264;
    pub const EXIF_IFD: u16 = 34665;
    pub const ICC_PROFILE: u16 = 34675;
    pub const GEO_KEY_DIRECTORY: u16 = 34735;
    pub const GEO_DOUBLE_PARAMS: u16 = 34736;
    pub const GEO_ASCII_PARAMS: u16 = 34737;
    pub const GPS_IFD: u16 = 34853;
    pub const DATE_TIME_ORIGINAL: u16 = 36867;
    pub const DATE_TIME_DIGITIZED: u16 = 36868;
}

/// TIFF datatype codes
pub mod dtypes {
    pub const BYTE: u16 = 1;
    pub const ASCII: u16 = 2;
    pub const SHORT: u16 = 3;
    pub const LONG: u16 = 4;
    pub const RATIONAL: u16 = 5;
    pub const UNDEFINED: u16 = 7;
    pub const SLONG: u16 = 9;
    pub const SRATIONAL: u16 = 10;
    pub const FLOAT: u16 = 11;
    pub const DOUBLE: u16 = 12;
    pub const IFD: u16 = 13;
    pub const LONG8: u16 = 16;
    pub const SLONG8: u16 = 17;
    pub const IFD8: u16 = 18;
}

/// Classic TIFF version number
pub const TIFF: u16 = 42;
/// BigTIFF version number
pub const BIGTIFF: u16 = 43;

/// Maximum number of entries we accept in a single IFD
const MAX_IFD_ENTRIES: u64 = 1000;

/// Bytes per element for each supported datatype
///
/// Datatype codes outside this table cannot be decoded; encountering one is
/// fatal, never a recoverable condition.
fn dtype_size(dtype: u16) -> Result<u64> {
    let size = match dtype {
        dtypes::BYTE | dtypes::ASCII | dtypes::UNDEFINED => 1,
        dtypes::SHORT => 2,
        dtypes::LONG | dtypes::SLONG | dtypes::FLOAT | dtypes::IFD => 4,
        dtypes::RATIONAL
        | dtypes::SRATIONAL
        | dtypes::DOUBLE
        | dtypes::LONG8
        | dtypes::SLONG8
        | dtypes::IFD8 => 8,
        _ => {
            return Err(Error::InvalidTiff(format!(
                "invalid TIFF tag datatype ({dtype})"
            )))
        }
    };
    Ok(size)
}

/// A single decoded element of an IFD entry payload
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IfdValue {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
}

impl IfdValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            IfdValue::Unsigned(v) => Some(*v),
            _ => None,
        }
    }
}

/// Payload of an IFD entry
///
/// The EXIF and GPS pointer tags hold not a value but the offset of a nested
/// directory; those decode into `Directory`. RATIONAL and SRATIONAL types
/// pack two integers per logical value, so their `Values` vector holds
/// `2 * count` elements.
#[derive(Debug, Clone, PartialEq)]
pub enum IfdPayload {
    Values(Vec<IfdValue>),
    Directory(Ifd),
}

/// One entry of an IFD: datatype, element count, decoded payload
#[derive(Debug, Clone, PartialEq)]
pub struct IfdEntry {
    pub dtype: u16,
    pub count: u64,
    pub payload: IfdPayload,
}

impl IfdEntry {
    pub fn values(&self) -> Option<&[IfdValue]> {
        match &self.payload {
            IfdPayload::Values(v) => Some(v),
            IfdPayload::Directory(_) => None,
        }
    }
}

/// A decoded Image File Directory: tag number -> entry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ifd {
    pub entries: BTreeMap<u16, IfdEntry>,
}

impl Ifd {
    pub fn get(&self, tag: u16) -> Option<&IfdEntry> {
        self.entries.get(&tag)
    }

    pub fn insert(&mut self, tag: u16, entry: IfdEntry) {
        self.entries.insert(tag, entry);
    }

    pub fn remove(&mut self, tag: u16) -> Option<IfdEntry> {
        self.entries.remove(&tag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a GeoTIFF key directory was observed
    ///
    /// Selects the GeoTIFF UUID over the generic EXIF UUID on output.
    pub fn has_geotiff_tags(&self) -> bool {
        self.entries.contains_key(&tags::GEO_KEY_DIRECTORY)
    }

    /// Fetch the raw bytes of a BYTE/ASCII/UNDEFINED entry
    pub fn byte_payload(&self, tag: u16) -> Option<Vec<u8>> {
        let entry = self.get(tag)?;
        match entry.dtype {
            dtypes::BYTE | dtypes::ASCII | dtypes::UNDEFINED => {
                let values = entry.values()?;
                Some(
                    values
                        .iter()
                        .filter_map(|v| v.as_u64().map(|u| u as u8))
                        .collect(),
                )
            }
            _ => None,
        }
    }

    /// Fetch an ASCII entry as a string, trimming the NUL terminator
    pub fn ascii_payload(&self, tag: u16) -> Option<String> {
        let bytes = self.byte_payload(tag)?;
        let s = String::from_utf8(bytes).ok()?;
        Some(s.trim_end_matches('\0').to_string())
    }
}

/// TIFF header: byte order, version, first IFD offset
#[derive(Debug, Clone, Copy)]
pub struct TiffHeader {
    pub endian: Endian,
    pub version: u16,
    pub first_ifd_offset: u64,
}

/// Read a TIFF header and leave the cursor at the start of the first IFD
pub fn read_tiff_header<R: Read + Seek>(reader: &mut R) -> Result<TiffHeader> {
    let order = read_exact(reader, 2)?;
    let endian = match (order[0], order[1]) {
        (0x49, 0x49) => Endian::LittleEndian,
        (0x4d, 0x4d) => Endian::BigEndian,
        _ => {
            return Err(Error::InvalidTiff(format!(
                "the byte order indication in the TIFF header \
                 ({:02x}{:02x}) is invalid; it should be either 4949 or 4d4d",
                order[0], order[1]
            )))
        }
    };

    let version = endian.read_u16(reader)?;
    let first_ifd_offset = match version {
        TIFF => endian.read_u32(reader)? as u64,
        BIGTIFF => {
            // offset bytesize (always 8) and a reserved word precede the
            // actual offset
            let _bytesize = endian.read_u16(reader)?;
            let _reserved = endian.read_u16(reader)?;
            endian.read_u64(reader)?
        }
        _ => {
            return Err(Error::InvalidTiff(format!(
                "unrecognized TIFF version ({version})"
            )))
        }
    };

    reader.seek(SeekFrom::Start(first_ifd_offset))?;

    Ok(TiffHeader {
        endian,
        version,
        first_ifd_offset,
    })
}

/// Decode `count` elements of datatype `dtype` from an in-memory buffer
fn decode_values(
    endian: Endian,
    dtype: u16,
    count: u64,
    buffer: &[u8],
) -> Result<Vec<IfdValue>> {
    // rationals pack two integers per value
    let nelts = match dtype {
        dtypes::RATIONAL | dtypes::SRATIONAL => 2 * count,
        _ => count,
    };

    let mut cursor = Cursor::new(buffer);
    let mut values = Vec::with_capacity(nelts as usize);
    for _ in 0..nelts {
        let value = match dtype {
            dtypes::BYTE | dtypes::ASCII | dtypes::UNDEFINED => {
                let b = read_exact(&mut cursor, 1)?;
                IfdValue::Unsigned(b[0] as u64)
            }
            dtypes::SHORT => IfdValue::Unsigned(endian.read_u16(&mut cursor)? as u64),
            dtypes::LONG | dtypes::IFD | dtypes::RATIONAL => {
                IfdValue::Unsigned(endian.read_u32(&mut cursor)? as u64)
            }
            dtypes::SLONG | dtypes::SRATIONAL => {
                IfdValue::Signed(endian.read_i32(&mut cursor)? as i64)
            }
            dtypes::FLOAT => IfdValue::Float(endian.read_f32(&mut cursor)? as f64),
            dtypes::DOUBLE => IfdValue::Float(endian.read_f64(&mut cursor)?),
            dtypes::LONG8 | dtypes::IFD8 => IfdValue::Unsigned(endian.read_u64(&mut cursor)?),
            dtypes::SLONG8 => IfdValue::Signed(endian.read_i64(&mut cursor)?),
            _ => {
                return Err(Error::InvalidTiff(format!(
                    "invalid TIFF tag datatype ({dtype})"
                )))
            }
        };
        values.push(value);
    }
    Ok(values)
}

/// Read the IFD at the current cursor position
///
/// Handles both classic and BigTIFF entry layouts according to
/// `header.version`. The EXIF and GPS pointer tags are followed into nested
/// directories; the outer cursor position is restored afterwards.
pub fn read_ifd<R: Read + Seek>(reader: &mut R, header: &TiffHeader) -> Result<Ifd> {
    let endian = header.endian;
    let big = header.version == BIGTIFF;

    let entry_len: u64 = if big { 20 } else { 12 };
    let inline_capacity: u64 = if big { 8 } else { 4 };

    let num_tags = if big {
        endian.read_u64(reader)?
    } else {
        endian.read_u16(reader)? as u64
    };

    if num_tags > MAX_IFD_ENTRIES {
        return Err(Error::InvalidTiff(format!(
            "IFD claims {num_tags} entries, refusing to read more than \
             {MAX_IFD_ENTRIES}"
        )));
    }

    // The fixed entry table; payloads that do not fit inline follow it
    // elsewhere in the stream.
    let table = read_exact(reader, (num_tags * entry_len) as usize)?;

    let mut ifd = Ifd::default();

    for idx in 0..num_tags as usize {
        let entry_buf = &table[idx * entry_len as usize..(idx + 1) * entry_len as usize];
        let mut cursor = Cursor::new(entry_buf);

        let tag = endian.read_u16(&mut cursor)?;
        let dtype = endian.read_u16(&mut cursor)?;
        let count = if big {
            endian.read_u64(&mut cursor)?
        } else {
            endian.read_u32(&mut cursor)? as u64
        };
        let inline = &entry_buf[entry_buf.len() - inline_capacity as usize..];
        let offset = {
            let mut c = Cursor::new(inline);
            if big {
                endian.read_u64(&mut c)?
            } else {
                endian.read_u32(&mut c)? as u64
            }
        };

        log::debug!("tag {tag}, dtype {dtype}, count {count}");

        let payload_length = dtype_size(dtype)?
            .checked_mul(count)
            .ok_or_else(|| Error::InvalidTiff(format!("tag {tag} payload length overflows")))?;

        let payload = if tag == tags::EXIF_IFD || tag == tags::GPS_IFD {
            // a nested directory lives at the stored offset; go get it and
            // come back
            let orig_pos = reader.stream_position()?;
            reader.seek(SeekFrom::Start(offset))?;
            let nested = read_ifd(reader, header)?;
            reader.seek(SeekFrom::Start(orig_pos))?;
            IfdPayload::Directory(nested)
        } else if payload_length > inline_capacity {
            let orig_pos = reader.stream_position()?;
            reader.seek(SeekFrom::Start(offset))?;
            let buffer = read_exact(reader, payload_length as usize)?;
            reader.seek(SeekFrom::Start(orig_pos))?;
            IfdPayload::Values(decode_values(endian, dtype, count, &buffer)?)
        } else {
            IfdPayload::Values(decode_values(endian, dtype, count, inline)?)
        };

        ifd.insert(
            tag,
            IfdEntry {
                dtype,
                count,
                payload,
            },
        );
    }

    Ok(ifd)
}

/// Encode one payload element in the classic little-endian output layout
fn encode_value<W: Write>(writer: &mut W, dtype: u16, value: &IfdValue) -> Result<()> {
    match (dtype, value) {
        (dtypes::BYTE | dtypes::ASCII | dtypes::UNDEFINED, IfdValue::Unsigned(v)) => {
            writer.write_u8(*v as u8)?
        }
        (dtypes::SHORT, IfdValue::Unsigned(v)) => writer.write_u16::<LittleEndian>(*v as u16)?,
        (dtypes::LONG | dtypes::IFD | dtypes::RATIONAL, IfdValue::Unsigned(v)) => {
            writer.write_u32::<LittleEndian>(*v as u32)?
        }
        (dtypes::SLONG | dtypes::SRATIONAL, IfdValue::Signed(v)) => {
            writer.write_i32::<LittleEndian>(*v as i32)?
        }
        (dtypes::FLOAT, IfdValue::Float(v)) => writer.write_f32::<LittleEndian>(*v as f32)?,
        (dtypes::DOUBLE, IfdValue::Float(v)) => writer.write_f64::<LittleEndian>(*v)?,
        (dtypes::LONG8 | dtypes::IFD8, IfdValue::Unsigned(v)) => {
            writer.write_u64::<LittleEndian>(*v)?
        }
        (dtypes::SLONG8, IfdValue::Signed(v)) => writer.write_i64::<LittleEndian>(*v)?,
        _ => {
            return Err(Error::InvalidTiff(format!(
                "datatype {dtype} cannot encode {value:?}"
            )))
        }
    }
    Ok(())
}

/// Write an IFD into an in-memory buffer, classic little-endian layout
///
/// BigTIFF input is down-converted: entries are always written with 12-byte
/// framing and 4-byte offsets. Lone narrow unsigned values (BYTE, SHORT,
/// LONG families with count 1) are written as 4-byte words while keeping the
/// original datatype code, so the rewritten copy is value-equal but stores
/// wider inline data than the datatype strictly needs. This is a deliberate
/// lossy simplification.
///
/// Tags listed in `exclude` are dropped, at every nesting level. The EXIF
/// and GPS pointer tags recurse, chaining the out-of-line write position
/// through the nested directory. Returns the next free offset after all
/// payloads, so a caller can continue appending to the same buffer.
pub fn write_ifd(
    buffer: &mut Cursor<Vec<u8>>,
    ifd: &Ifd,
    exclude: &[u16],
) -> Result<u64> {
    const ENTRY_LEN: u64 = 12;
    const INLINE_CAPACITY: u64 = 4;

    let tags_to_write: Vec<(&u16, &IfdEntry)> = ifd
        .entries
        .iter()
        .filter(|(tag, _)| !exclude.contains(*tag))
        .collect();

    let num_tags = tags_to_write.len() as u64;
    buffer.write_u16::<LittleEndian>(num_tags as u16)?;

    let ifd_start = buffer.position();
    let mut after_ifd_position = ifd_start + num_tags * ENTRY_LEN;

    for (idx, (tag, entry)) in tags_to_write.iter().enumerate() {
        let tag_offset = ifd_start + idx as u64 * ENTRY_LEN;
        log::debug!("tag {tag}: entry at {tag_offset}, payloads at {after_ifd_position}");

        buffer.seek(SeekFrom::Start(tag_offset))?;

        let payload_length = dtype_size(entry.dtype)?
            .checked_mul(entry.count)
            .ok_or_else(|| Error::InvalidTiff(format!("tag {tag} payload length overflows")))?;

        if **tag == tags::EXIF_IFD || **tag == tags::GPS_IFD {
            let nested = match &entry.payload {
                IfdPayload::Directory(nested) => nested,
                IfdPayload::Values(_) => {
                    return Err(Error::InvalidTiff(format!(
                        "tag {tag} must hold a nested directory"
                    )))
                }
            };

            buffer.write_u16::<LittleEndian>(**tag)?;
            buffer.write_u16::<LittleEndian>(entry.dtype)?;
            buffer.write_u32::<LittleEndian>(entry.count as u32)?;
            buffer.write_u32::<LittleEndian>(after_ifd_position as u32)?;

            buffer.seek(SeekFrom::Start(after_ifd_position))?;
            after_ifd_position = write_ifd(buffer, nested, exclude)?;
        } else if payload_length > INLINE_CAPACITY {
            let values = entry.values().ok_or_else(|| {
                Error::InvalidTiff(format!("tag {tag} holds a directory payload"))
            })?;

            buffer.write_u16::<LittleEndian>(**tag)?;
            buffer.write_u16::<LittleEndian>(entry.dtype)?;
            buffer.write_u32::<LittleEndian>(entry.count as u32)?;
            buffer.write_u32::<LittleEndian>(after_ifd_position as u32)?;

            // write the payload at the outlying position, then track the
            // next free position for the following out-of-line payload
            buffer.seek(SeekFrom::Start(after_ifd_position))?;
            for value in values {
                encode_value(buffer, entry.dtype, value)?;
            }
            after_ifd_position = buffer.position();
        } else {
            let values = entry.values().ok_or_else(|| {
                Error::InvalidTiff(format!("tag {tag} holds a directory payload"))
            })?;

            buffer.write_u16::<LittleEndian>(**tag)?;
            buffer.write_u16::<LittleEndian>(entry.dtype)?;
            buffer.write_u32::<LittleEndian>(entry.count as u32)?;

            let lone_narrow_unsigned = entry.count == 1
                && matches!(
                    entry.dtype,
                    dtypes::BYTE
                        | dtypes::ASCII
                        | dtypes::SHORT
                        | dtypes::LONG
                        | dtypes::UNDEFINED
                        | dtypes::IFD
                );
            if lone_narrow_unsigned {
                // promoted to a full 32-bit word; datatype code is preserved
                let v = values[0]
                    .as_u64()
                    .ok_or_else(|| Error::InvalidTiff(format!("tag {tag} value mismatch")))?;
                buffer.write_u32::<LittleEndian>(v as u32)?;
            } else {
                for value in values {
                    encode_value(buffer, entry.dtype, value)?;
                }
            }
        }
    }

    // an inline payload narrower than 4 bytes can leave the buffer short of
    // the full fixed table; pad so a reader sees every entry
    if (buffer.get_ref().len() as u64) < after_ifd_position {
        buffer.get_mut().resize(after_ifd_position as usize, 0);
    }
    buffer.seek(SeekFrom::Start(after_ifd_position))?;

    Ok(after_ifd_position)
}
