//! JP2/JPX box model
//!
//! Everything in a JPEG 2000 container is a box: a length-prefixed, tagged
//! chunk that either carries a flat payload or nests other boxes (a
//! superbox). This module parses a byte range into a tree of boxes and
//! serializes a tree back to bytes.
//!
//! Box framing (big-endian): `[4-byte length | 4-byte id | payload]`, where
//! a length of 1 signals a following 8-byte extended length and a length of
//! 0 means the box extends to the end of its container (legal only for the
//! last box).

use crate::error::{Error, Result, StructuralWarning};
use crate::stream::read_exact;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{Read, Seek, SeekFrom, Write};

/// 4-character box code
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCC('{self}')")
    }
}

/// Recognized box ids
pub mod ids {
    use super::FourCC;

    pub const SIGNATURE: FourCC = FourCC(*b"jP  ");
    pub const FILE_TYPE: FourCC = FourCC(*b"ftyp");
    pub const JP2_HEADER: FourCC = FourCC(*b"jp2h");
    pub const IMAGE_HEADER: FourCC = FourCC(*b"ihdr");
    pub const COLOUR_SPECIFICATION: FourCC = FourCC(*b"colr");
    pub const BITS_PER_COMPONENT: FourCC = FourCC(*b"bpcc");
    pub const PALETTE: FourCC = FourCC(*b"pclr");
    pub const COMPONENT_MAPPING: FourCC = FourCC(*b"cmap");
    pub const CHANNEL_DEFINITION: FourCC = FourCC(*b"cdef");
    pub const RESOLUTION: FourCC = FourCC(*b"res ");
    pub const CAPTURE_RESOLUTION: FourCC = FourCC(*b"resc");
    pub const DISPLAY_RESOLUTION: FourCC = FourCC(*b"resd");
    pub const CODESTREAM: FourCC = FourCC(*b"jp2c");
    pub const XML: FourCC = FourCC(*b"xml ");
    pub const UUID: FourCC = FourCC(*b"uuid");
    pub const UUID_INFO: FourCC = FourCC(*b"uinf");
    pub const UUID_LIST: FourCC = FourCC(*b"ulst");
    pub const URL: FourCC = FourCC(*b"url ");
    pub const FREE: FourCC = FourCC(*b"free");

    // JPX (ISO 15444-2) additions
    pub const ASSOCIATION: FourCC = FourCC(*b"asoc");
    pub const NUMBER_LIST: FourCC = FourCC(*b"nlst");
    pub const LABEL: FourCC = FourCC(*b"lbl ");
    pub const DATA_REFERENCE: FourCC = FourCC(*b"dtbl");
    pub const FRAGMENT_TABLE: FourCC = FourCC(*b"ftbl");
    pub const FRAGMENT_LIST: FourCC = FourCC(*b"flst");
    pub const CODESTREAM_HEADER: FourCC = FourCC(*b"jpch");
    pub const COMPOSITING_LAYER_HEADER: FourCC = FourCC(*b"jplh");
    pub const COLOUR_GROUP: FourCC = FourCC(*b"cgrp");
}

/// File type brands
pub mod brands {
    use super::FourCC;

    pub const JP2: FourCC = FourCC(*b"jp2 ");
    pub const JPX: FourCC = FourCC(*b"jpx ");
    pub const JPX_BASELINE: FourCC = FourCC(*b"jpxb");
}

/// Enumerated colourspaces
pub const SRGB: u32 = 16;
pub const GREYSCALE: u32 = 17;
pub const YCC: u32 = 18;

/// Colour specification methods
pub const ENUMERATED_COLORSPACE: u8 = 1;
pub const RESTRICTED_ICC_PROFILE: u8 = 2;
pub const ANY_ICC_PROFILE: u8 = 3;
pub const VENDOR_COLOUR_METHOD: u8 = 4;

/// UUID identifying an XMP packet payload
pub const XMP_UUID: [u8; 16] = [
    0xbe, 0x7a, 0xcf, 0xcb, 0x97, 0xa9, 0x42, 0xe8, 0x9c, 0x71, 0x99, 0x94, 0x91, 0xe3, 0xaf, 0xac,
];

/// UUID identifying an EXIF payload ("JpgTiffExif->JP2")
pub const EXIF_UUID: [u8; 16] = *b"JpgTiffExif->JP2";

/// UUID identifying a GeoTIFF payload
pub const GEOTIFF_UUID: [u8; 16] = [
    0xb1, 0x4b, 0xf8, 0xbd, 0x08, 0x3d, 0x4b, 0x43, 0xa5, 0xae, 0x8c, 0xd7, 0xd5, 0xa6, 0xce, 0x03,
];

/// The fixed payload of the signature box
pub const SIGNATURE_PAYLOAD: [u8; 4] = [13, 10, 135, 10];

const HEADER_SIZE: u64 = 8;
const HEADER_SIZE_EXTENDED: u64 = 16;

/// Signature box: must be the very first box in the file
#[derive(Debug, Clone, PartialEq)]
pub struct SignatureBox {
    pub signature: [u8; 4],
}

impl Default for SignatureBox {
    fn default() -> Self {
        Self {
            signature: SIGNATURE_PAYLOAD,
        }
    }
}

/// File type box: brand and compatibility list select the conformance rules
#[derive(Debug, Clone, PartialEq)]
pub struct FileTypeBox {
    pub brand: FourCC,
    pub minor_version: u32,
    pub compatibility_list: Vec<FourCC>,
}

impl Default for FileTypeBox {
    fn default() -> Self {
        Self {
            brand: brands::JP2,
            minor_version: 0,
            compatibility_list: vec![brands::JP2],
        }
    }
}

impl FileTypeBox {
    pub fn is_compatible_with(&self, brand: FourCC) -> bool {
        self.compatibility_list.contains(&brand)
    }
}

/// Image header box: geometry and sample layout of the image
#[derive(Debug, Clone, PartialEq)]
pub struct ImageHeaderBox {
    pub height: u32,
    pub width: u32,
    pub num_components: u16,
    pub bits_per_component: u8,
    pub signed: bool,
    pub compression: u8,
    pub colorspace_unknown: bool,
    pub ip_provided: bool,
}

impl ImageHeaderBox {
    pub fn new(height: u32, width: u32, num_components: u16) -> Self {
        Self {
            height,
            width,
            num_components,
            bits_per_component: 8,
            signed: false,
            // 7 means wavelet compression, the only value JP2 allows
            compression: 7,
            colorspace_unknown: false,
            ip_provided: false,
        }
    }
}

/// Colour specification box
///
/// Either an enumerated colourspace or an embedded ICC profile, never both.
#[derive(Debug, Clone, PartialEq)]
pub struct ColourSpecificationBox {
    pub method: u8,
    pub precedence: u8,
    pub approximation: u8,
    pub colorspace: Option<u32>,
    pub icc_profile: Option<Vec<u8>>,
}

impl ColourSpecificationBox {
    pub fn enumerated(colorspace: u32) -> Self {
        Self {
            method: ENUMERATED_COLORSPACE,
            precedence: 0,
            approximation: 0,
            colorspace: Some(colorspace),
            icc_profile: None,
        }
    }

    pub fn with_icc_profile(icc_profile: Vec<u8>) -> Self {
        Self {
            method: RESTRICTED_ICC_PROFILE,
            precedence: 0,
            approximation: 0,
            colorspace: None,
            icc_profile: Some(icc_profile),
        }
    }
}

/// Channel definition box
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDefinitionBox {
    pub index: Vec<u16>,
    pub channel_type: Vec<u16>,
    pub association: Vec<u16>,
}

/// Palette box
#[derive(Debug, Clone, PartialEq)]
pub struct PaletteBox {
    /// raw B fields: bit depth minus one, sign flag in the high bit
    pub bits: Vec<u8>,
    /// one row per palette entry, one column per generated component
    pub entries: Vec<Vec<u32>>,
}

/// Component mapping box
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentMappingBox {
    pub component_index: Vec<u16>,
    pub mapping_type: Vec<u8>,
    pub palette_index: Vec<u8>,
}

/// Bits-per-component box, used when components differ in depth
#[derive(Debug, Clone, PartialEq)]
pub struct BitsPerComponentBox {
    pub bits_per_component: Vec<u8>,
    pub signed: Vec<bool>,
}

/// Capture/display resolution box payload
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionSubBox {
    pub vertical_numerator: u16,
    pub vertical_denominator: u16,
    pub horizontal_numerator: u16,
    pub horizontal_denominator: u16,
    pub vertical_exponent: i8,
    pub horizontal_exponent: i8,
}

impl ResolutionSubBox {
    /// Vertical resolution in grid points per meter
    pub fn vertical(&self) -> f64 {
        self.vertical_numerator as f64 / self.vertical_denominator as f64
            * 10f64.powi(self.vertical_exponent as i32)
    }

    /// Horizontal resolution in grid points per meter
    pub fn horizontal(&self) -> f64 {
        self.horizontal_numerator as f64 / self.horizontal_denominator as f64
            * 10f64.powi(self.horizontal_exponent as i32)
    }
}

/// Where a contiguous codestream box gets its bytes
///
/// Codestreams can be far too large to hold in memory, so a box parsed from
/// a file records the byte range instead; the wrap path streams that range
/// straight from the source.
#[derive(Debug, Clone, PartialEq)]
pub enum CodestreamSource {
    Memory(Vec<u8>),
    /// byte range of the raw codestream within the stream it was parsed from
    Range { offset: u64, length: u64 },
}

/// Contiguous codestream box
#[derive(Debug, Clone, PartialEq)]
pub struct ContiguousCodestreamBox {
    pub source: CodestreamSource,
}

impl ContiguousCodestreamBox {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            source: CodestreamSource::Memory(data),
        }
    }

    /// Offset of the codestream's main header within its original stream
    pub fn main_header_offset(&self) -> Option<u64> {
        match &self.source {
            CodestreamSource::Range { offset, .. } => Some(*offset),
            CodestreamSource::Memory(_) => None,
        }
    }
}

/// XML box, raw packet bytes
#[derive(Debug, Clone, PartialEq)]
pub struct XmlBox {
    pub xml: Vec<u8>,
}

/// UUID box: vendor metadata identified by a 16-byte UUID
#[derive(Debug, Clone, PartialEq)]
pub struct UuidBox {
    pub uuid: [u8; 16],
    pub data: Vec<u8>,
}

impl UuidBox {
    pub fn is_xmp(&self) -> bool {
        self.uuid == XMP_UUID
    }

    pub fn is_exif(&self) -> bool {
        self.uuid == EXIF_UUID
    }

    pub fn is_geotiff(&self) -> bool {
        self.uuid == GEOTIFF_UUID
    }
}

/// UUID list box, part of a UUID info superbox
#[derive(Debug, Clone, PartialEq)]
pub struct UuidListBox {
    pub uuids: Vec<[u8; 16]>,
}

/// Data entry URL box
#[derive(Debug, Clone, PartialEq)]
pub struct UrlBox {
    pub version: u8,
    pub flags: [u8; 3],
    /// NUL-terminated location bytes, kept raw for exact round-trips
    pub location: Vec<u8>,
}

impl UrlBox {
    pub fn url(&self) -> String {
        String::from_utf8_lossy(&self.location)
            .trim_end_matches('\0')
            .to_string()
    }
}

/// Label box (JPX)
#[derive(Debug, Clone, PartialEq)]
pub struct LabelBox {
    pub label: String,
}

/// Number list box (JPX)
#[derive(Debug, Clone, PartialEq)]
pub struct NumberListBox {
    pub associations: Vec<u32>,
}

/// Fragment list box (JPX)
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentListBox {
    pub fragment_offset: Vec<u64>,
    pub fragment_length: Vec<u32>,
    pub data_reference: Vec<u16>,
}

/// One node of the box tree
///
/// `offset` is the byte position in the file the box was parsed from, `None`
/// for boxes constructed in memory. `length` is the total rendered length
/// including the header; 0 means it has not been computed yet.
#[derive(Debug, Clone, PartialEq)]
pub struct Jp2Box {
    pub offset: Option<u64>,
    pub length: u64,
    pub data: BoxData,
}

/// Tagged payload for every recognized box kind
///
/// Flat kinds decode typed fields; superbox kinds carry their children in
/// document order.
#[derive(Debug, Clone, PartialEq)]
pub enum BoxData {
    Signature(SignatureBox),
    FileType(FileTypeBox),
    Jp2Header(Vec<Jp2Box>),
    ImageHeader(ImageHeaderBox),
    ColourSpecification(ColourSpecificationBox),
    ChannelDefinition(ChannelDefinitionBox),
    Palette(PaletteBox),
    ComponentMapping(ComponentMappingBox),
    BitsPerComponent(BitsPerComponentBox),
    Resolution(Vec<Jp2Box>),
    CaptureResolution(ResolutionSubBox),
    DisplayResolution(ResolutionSubBox),
    Codestream(ContiguousCodestreamBox),
    Xml(XmlBox),
    Uuid(UuidBox),
    UuidInfo(Vec<Jp2Box>),
    UuidList(UuidListBox),
    Url(UrlBox),
    Free,
    Label(LabelBox),
    Association(Vec<Jp2Box>),
    NumberList(NumberListBox),
    DataReference(Vec<Jp2Box>),
    FragmentTable(Vec<Jp2Box>),
    FragmentList(FragmentListBox),
    CodestreamHeader(Vec<Jp2Box>),
    CompositingLayerHeader(Vec<Jp2Box>),
    ColourGroup(Vec<Jp2Box>),
    Unknown { id: FourCC, data: Vec<u8> },
}

impl Jp2Box {
    pub fn new(data: BoxData) -> Self {
        Self {
            offset: None,
            length: 0,
            data,
        }
    }

    /// 4-character code for this box kind
    pub fn box_id(&self) -> FourCC {
        match &self.data {
            BoxData::Signature(_) => ids::SIGNATURE,
            BoxData::FileType(_) => ids::FILE_TYPE,
            BoxData::Jp2Header(_) => ids::JP2_HEADER,
            BoxData::ImageHeader(_) => ids::IMAGE_HEADER,
            BoxData::ColourSpecification(_) => ids::COLOUR_SPECIFICATION,
            BoxData::ChannelDefinition(_) => ids::CHANNEL_DEFINITION,
            BoxData::Palette(_) => ids::PALETTE,
            BoxData::ComponentMapping(_) => ids::COMPONENT_MAPPING,
            BoxData::BitsPerComponent(_) => ids::BITS_PER_COMPONENT,
            BoxData::Resolution(_) => ids::RESOLUTION,
            BoxData::CaptureResolution(_) => ids::CAPTURE_RESOLUTION,
            BoxData::DisplayResolution(_) => ids::DISPLAY_RESOLUTION,
            BoxData::Codestream(_) => ids::CODESTREAM,
            BoxData::Xml(_) => ids::XML,
            BoxData::Uuid(_) => ids::UUID,
            BoxData::UuidInfo(_) => ids::UUID_INFO,
            BoxData::UuidList(_) => ids::UUID_LIST,
            BoxData::Url(_) => ids::URL,
            BoxData::Free => ids::FREE,
            BoxData::Label(_) => ids::LABEL,
            BoxData::Association(_) => ids::ASSOCIATION,
            BoxData::NumberList(_) => ids::NUMBER_LIST,
            BoxData::DataReference(_) => ids::DATA_REFERENCE,
            BoxData::FragmentTable(_) => ids::FRAGMENT_TABLE,
            BoxData::FragmentList(_) => ids::FRAGMENT_LIST,
            BoxData::CodestreamHeader(_) => ids::CODESTREAM_HEADER,
            BoxData::CompositingLayerHeader(_) => ids::COMPOSITING_LAYER_HEADER,
            BoxData::ColourGroup(_) => ids::COLOUR_GROUP,
            BoxData::Unknown { id, .. } => *id,
        }
    }

    /// Children of a superbox, `None` for flat boxes
    pub fn children(&self) -> Option<&[Jp2Box]> {
        match &self.data {
            BoxData::Jp2Header(children)
            | BoxData::Resolution(children)
            | BoxData::UuidInfo(children)
            | BoxData::Association(children)
            | BoxData::DataReference(children)
            | BoxData::FragmentTable(children)
            | BoxData::CodestreamHeader(children)
            | BoxData::CompositingLayerHeader(children)
            | BoxData::ColourGroup(children) => Some(children),
            _ => None,
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut Vec<Jp2Box>> {
        match &mut self.data {
            BoxData::Jp2Header(children)
            | BoxData::Resolution(children)
            | BoxData::UuidInfo(children)
            | BoxData::Association(children)
            | BoxData::DataReference(children)
            | BoxData::FragmentTable(children)
            | BoxData::CodestreamHeader(children)
            | BoxData::CompositingLayerHeader(children)
            | BoxData::ColourGroup(children) => Some(children),
            _ => None,
        }
    }
}

/// Parse all boxes in `[current position, end_offset)`
///
/// The caller passes the container's end: the file size for the top level,
/// the box body end when recursing into a superbox. A zero length field is
/// resolved against `end_offset`, which is why the last box in a file can
/// only be sized once the total file length is known.
pub fn parse_superbox<R: Read + Seek>(
    reader: &mut R,
    end_offset: u64,
    warnings: &mut Vec<StructuralWarning>,
) -> Result<Vec<Jp2Box>> {
    let mut boxes = Vec::new();
    let mut start = reader.stream_position()?;

    while start < end_offset {
        if end_offset - start < HEADER_SIZE {
            let count = (end_offset - start) as usize;
            log::warn!("{count} extra bytes at end of container ignored");
            warnings.push(StructuralWarning::TrailingBytes { count });
            break;
        }

        let length_field = reader.read_u32::<BigEndian>()?;
        let mut id = [0u8; 4];
        reader.read_exact(&mut id)?;
        let id = FourCC(id);

        let (num_bytes, header_size) = if length_field == 0 {
            // extends to the end of the container
            (end_offset - start, HEADER_SIZE)
        } else if length_field == 1 {
            (reader.read_u64::<BigEndian>()?, HEADER_SIZE_EXTENDED)
        } else {
            (length_field as u64, HEADER_SIZE)
        };

        if num_bytes < header_size {
            return Err(Error::InvalidStructure(format!(
                "the '{id}' box at offset {start} claims a length of \
                 {num_bytes} bytes, less than its own header"
            )));
        }

        if num_bytes > end_offset - start {
            log::warn!(
                "the '{id}' box at offset {start} claims {num_bytes} bytes \
                 but only {} remain",
                end_offset - start
            );
            warnings.push(StructuralWarning::BoxOverrunsFile {
                id,
                length: num_bytes,
                available: end_offset - start,
            });
        }

        let body_len = num_bytes - header_size;
        let parsed = parse_box_data(reader, id, start, header_size, body_len, warnings);
        let data = match parsed {
            Ok(data) => data,
            Err(err) => {
                // a malformed child should not take down the whole tree;
                // degrade it to an unknown box holding the raw payload
                log::warn!(
                    "error while parsing a '{id}' box at offset {start}: {err}"
                );
                reader.seek(SeekFrom::Start(start + header_size))?;
                let available = (end_offset - start).saturating_sub(header_size);
                let data = read_exact(reader, body_len.min(available) as usize)?;
                BoxData::Unknown { id, data }
            }
        };

        boxes.push(Jp2Box {
            offset: Some(start),
            length: num_bytes,
            data,
        });

        reader.seek(SeekFrom::Start(start + num_bytes))?;
        start += num_bytes;
    }

    Ok(boxes)
}

/// Parse one box body; the cursor is at the start of the payload
fn parse_box_data<R: Read + Seek>(
    reader: &mut R,
    id: FourCC,
    start: u64,
    header_size: u64,
    body_len: u64,
    warnings: &mut Vec<StructuralWarning>,
) -> Result<BoxData> {
    let body_end = start + header_size + body_len;
    let data = match id {
        ids::SIGNATURE => {
            let bytes = read_exact(reader, 4)?;
            BoxData::Signature(SignatureBox {
                signature: [bytes[0], bytes[1], bytes[2], bytes[3]],
            })
        }
        ids::FILE_TYPE => {
            let mut brand = [0u8; 4];
            reader.read_exact(&mut brand)?;
            let minor_version = reader.read_u32::<BigEndian>()?;
            let num_entries = (body_len.saturating_sub(8)) / 4;
            let mut compatibility_list = Vec::with_capacity(num_entries as usize);
            for _ in 0..num_entries {
                let mut entry = [0u8; 4];
                reader.read_exact(&mut entry)?;
                compatibility_list.push(FourCC(entry));
            }
            BoxData::FileType(FileTypeBox {
                brand: FourCC(brand),
                minor_version,
                compatibility_list,
            })
        }
        ids::JP2_HEADER => BoxData::Jp2Header(parse_superbox(reader, body_end, warnings)?),
        ids::IMAGE_HEADER => {
            let height = reader.read_u32::<BigEndian>()?;
            let width = reader.read_u32::<BigEndian>()?;
            let num_components = reader.read_u16::<BigEndian>()?;
            let bpc = reader.read_u8()?;
            let compression = reader.read_u8()?;
            let colorspace_unknown = reader.read_u8()? != 0;
            let ip_provided = reader.read_u8()? != 0;
            BoxData::ImageHeader(ImageHeaderBox {
                height,
                width,
                num_components,
                bits_per_component: (bpc & 0x7f) + 1,
                signed: (bpc & 0x80) > 0,
                compression,
                colorspace_unknown,
                ip_provided,
            })
        }
        ids::COLOUR_SPECIFICATION => {
            let method = reader.read_u8()?;
            let precedence = reader.read_u8()?;
            let approximation = reader.read_u8()?;
            let remaining = body_len.saturating_sub(3);
            let (colorspace, icc_profile) = if method == ENUMERATED_COLORSPACE {
                (Some(reader.read_u32::<BigEndian>()?), None)
            } else if remaining < 128 {
                // an ICC profile header alone is 128 bytes
                log::warn!(
                    "an ICC profile in a colour specification box at offset \
                     {start} is corrupt: {remaining} bytes is too short"
                );
                (None, None)
            } else {
                (None, Some(read_exact(reader, remaining as usize)?))
            };
            BoxData::ColourSpecification(ColourSpecificationBox {
                method,
                precedence,
                approximation,
                colorspace,
                icc_profile,
            })
        }
        ids::CHANNEL_DEFINITION => {
            let num_channels = reader.read_u16::<BigEndian>()?;
            let mut index = Vec::with_capacity(num_channels as usize);
            let mut channel_type = Vec::with_capacity(num_channels as usize);
            let mut association = Vec::with_capacity(num_channels as usize);
            for _ in 0..num_channels {
                index.push(reader.read_u16::<BigEndian>()?);
                channel_type.push(reader.read_u16::<BigEndian>()?);
                association.push(reader.read_u16::<BigEndian>()?);
            }
            BoxData::ChannelDefinition(ChannelDefinitionBox {
                index,
                channel_type,
                association,
            })
        }
        ids::PALETTE => {
            let num_entries = reader.read_u16::<BigEndian>()?;
            let num_columns = reader.read_u8()?;
            let mut bits = Vec::with_capacity(num_columns as usize);
            for _ in 0..num_columns {
                bits.push(reader.read_u8()?);
            }
            let mut entries = Vec::with_capacity(num_entries as usize);
            for _ in 0..num_entries {
                let mut row = Vec::with_capacity(num_columns as usize);
                for b in &bits {
                    let width = ((b & 0x7f) as usize + 8) / 8;
                    let mut value: u32 = 0;
                    for _ in 0..width {
                        value = (value << 8) | reader.read_u8()? as u32;
                    }
                    row.push(value);
                }
                entries.push(row);
            }
            BoxData::Palette(PaletteBox { bits, entries })
        }
        ids::COMPONENT_MAPPING => {
            let num_entries = body_len / 4;
            let mut component_index = Vec::with_capacity(num_entries as usize);
            let mut mapping_type = Vec::with_capacity(num_entries as usize);
            let mut palette_index = Vec::with_capacity(num_entries as usize);
            for _ in 0..num_entries {
                component_index.push(reader.read_u16::<BigEndian>()?);
                mapping_type.push(reader.read_u8()?);
                palette_index.push(reader.read_u8()?);
            }
            BoxData::ComponentMapping(ComponentMappingBox {
                component_index,
                mapping_type,
                palette_index,
            })
        }
        ids::BITS_PER_COMPONENT => {
            let bytes = read_exact(reader, body_len as usize)?;
            BoxData::BitsPerComponent(BitsPerComponentBox {
                bits_per_component: bytes.iter().map(|b| (b & 0x7f) + 1).collect(),
                signed: bytes.iter().map(|b| (b & 0x80) > 0).collect(),
            })
        }
        ids::RESOLUTION => BoxData::Resolution(parse_superbox(reader, body_end, warnings)?),
        ids::CAPTURE_RESOLUTION => BoxData::CaptureResolution(parse_resolution_sub(reader)?),
        ids::DISPLAY_RESOLUTION => BoxData::DisplayResolution(parse_resolution_sub(reader)?),
        ids::CODESTREAM => BoxData::Codestream(ContiguousCodestreamBox {
            source: CodestreamSource::Range {
                offset: start + header_size,
                length: body_len,
            },
        }),
        ids::XML => BoxData::Xml(XmlBox {
            xml: read_exact(reader, body_len as usize)?,
        }),
        ids::UUID => {
            let remaining = body_len.checked_sub(16).ok_or_else(|| {
                Error::InvalidStructure(format!(
                    "the uuid box at offset {start} is too short to hold a UUID"
                ))
            })?;
            let uuid_bytes = read_exact(reader, 16)?;
            let mut uuid = [0u8; 16];
            uuid.copy_from_slice(&uuid_bytes);
            let data = read_exact(reader, remaining as usize)?;
            BoxData::Uuid(UuidBox { uuid, data })
        }
        ids::UUID_INFO => BoxData::UuidInfo(parse_superbox(reader, body_end, warnings)?),
        ids::UUID_LIST => {
            let count = reader.read_u16::<BigEndian>()?;
            let mut uuids = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let bytes = read_exact(reader, 16)?;
                let mut uuid = [0u8; 16];
                uuid.copy_from_slice(&bytes);
                uuids.push(uuid);
            }
            BoxData::UuidList(UuidListBox { uuids })
        }
        ids::URL => {
            let remaining = body_len.checked_sub(4).ok_or_else(|| {
                Error::InvalidStructure(format!(
                    "the url box at offset {start} is too short"
                ))
            })?;
            let version = reader.read_u8()?;
            let mut flags = [0u8; 3];
            reader.read_exact(&mut flags)?;
            let location = read_exact(reader, remaining as usize)?;
            BoxData::Url(UrlBox {
                version,
                flags,
                location,
            })
        }
        ids::FREE => {
            reader.seek(SeekFrom::Start(body_end))?;
            BoxData::Free
        }
        ids::LABEL => {
            let bytes = read_exact(reader, body_len as usize)?;
            BoxData::Label(LabelBox {
                label: String::from_utf8_lossy(&bytes).to_string(),
            })
        }
        ids::ASSOCIATION => BoxData::Association(parse_superbox(reader, body_end, warnings)?),
        ids::NUMBER_LIST => {
            let count = body_len / 4;
            let mut associations = Vec::with_capacity(count as usize);
            for _ in 0..count {
                associations.push(reader.read_u32::<BigEndian>()?);
            }
            BoxData::NumberList(NumberListBox { associations })
        }
        ids::DATA_REFERENCE => {
            // entry count, then that many data entry URL boxes
            let _num_entries = reader.read_u16::<BigEndian>()?;
            BoxData::DataReference(parse_superbox(reader, body_end, warnings)?)
        }
        ids::FRAGMENT_TABLE => {
            BoxData::FragmentTable(parse_superbox(reader, body_end, warnings)?)
        }
        ids::FRAGMENT_LIST => {
            let count = reader.read_u16::<BigEndian>()?;
            let mut fragment_offset = Vec::with_capacity(count as usize);
            let mut fragment_length = Vec::with_capacity(count as usize);
            let mut data_reference = Vec::with_capacity(count as usize);
            for _ in 0..count {
                fragment_offset.push(reader.read_u64::<BigEndian>()?);
                fragment_length.push(reader.read_u32::<BigEndian>()?);
                data_reference.push(reader.read_u16::<BigEndian>()?);
            }
            BoxData::FragmentList(FragmentListBox {
                fragment_offset,
                fragment_length,
                data_reference,
            })
        }
        ids::CODESTREAM_HEADER => {
            BoxData::CodestreamHeader(parse_superbox(reader, body_end, warnings)?)
        }
        ids::COMPOSITING_LAYER_HEADER => {
            BoxData::CompositingLayerHeader(parse_superbox(reader, body_end, warnings)?)
        }
        ids::COLOUR_GROUP => BoxData::ColourGroup(parse_superbox(reader, body_end, warnings)?),
        _ => {
            log::warn!("unrecognized box '{id}' at offset {start}");
            warnings.push(StructuralWarning::UnrecognizedBox { id, offset: start });
            BoxData::Unknown {
                id,
                data: read_exact(reader, body_len as usize)?,
            }
        }
    };
    Ok(data)
}

fn parse_resolution_sub<R: Read + Seek>(reader: &mut R) -> Result<ResolutionSubBox> {
    let vertical_numerator = reader.read_u16::<BigEndian>()?;
    let vertical_denominator = reader.read_u16::<BigEndian>()?;
    let horizontal_numerator = reader.read_u16::<BigEndian>()?;
    let horizontal_denominator = reader.read_u16::<BigEndian>()?;
    let vertical_exponent = reader.read_i8()?;
    let horizontal_exponent = reader.read_i8()?;
    Ok(ResolutionSubBox {
        vertical_numerator,
        vertical_denominator,
        horizontal_numerator,
        horizontal_denominator,
        vertical_exponent,
        horizontal_exponent,
    })
}

/// Emit a box header for a body of `body_len` bytes, returning header size
///
/// Bodies too large for the 32-bit length field get the extended form:
/// length field 1 followed by the 64-bit total length.
pub(crate) fn write_box_header<W: Write>(
    writer: &mut W,
    id: FourCC,
    body_len: u64,
) -> Result<u64> {
    if body_len + HEADER_SIZE > u32::MAX as u64 {
        writer.write_u32::<BigEndian>(1)?;
        writer.write_all(id.as_bytes())?;
        writer.write_u64::<BigEndian>(body_len + HEADER_SIZE_EXTENDED)?;
        Ok(HEADER_SIZE_EXTENDED)
    } else {
        writer.write_u32::<BigEndian>((body_len + HEADER_SIZE) as u32)?;
        writer.write_all(id.as_bytes())?;
        Ok(HEADER_SIZE)
    }
}

impl Jp2Box {
    /// Serialize this box, returning the total bytes written
    ///
    /// A superbox serializes its children first to learn its own length. A
    /// codestream box must hold its bytes in memory to be written this way;
    /// wrapping a codestream that lives in another file is the wrap
    /// routine's job, which streams the range instead.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<u64> {
        let body = self.body_bytes()?;
        let header_size = write_box_header(writer, self.box_id(), body.len() as u64)?;
        writer.write_all(&body)?;
        Ok(header_size + body.len() as u64)
    }

    /// Render the box body to bytes
    pub(crate) fn body_bytes(&self) -> Result<Vec<u8>> {
        let mut b: Vec<u8> = Vec::new();
        match &self.data {
            BoxData::Signature(sig) => b.extend_from_slice(&sig.signature),
            BoxData::FileType(ftyp) => {
                b.extend_from_slice(ftyp.brand.as_bytes());
                b.write_u32::<BigEndian>(ftyp.minor_version)?;
                for entry in &ftyp.compatibility_list {
                    b.extend_from_slice(entry.as_bytes());
                }
            }
            BoxData::ImageHeader(ihdr) => {
                b.write_u32::<BigEndian>(ihdr.height)?;
                b.write_u32::<BigEndian>(ihdr.width)?;
                b.write_u16::<BigEndian>(ihdr.num_components)?;
                let mut bpc = ihdr.bits_per_component - 1;
                if ihdr.signed {
                    bpc |= 0x80;
                }
                b.write_u8(bpc)?;
                b.write_u8(ihdr.compression)?;
                b.write_u8(ihdr.colorspace_unknown as u8)?;
                b.write_u8(ihdr.ip_provided as u8)?;
            }
            BoxData::ColourSpecification(colr) => {
                b.write_u8(colr.method)?;
                b.write_u8(colr.precedence)?;
                b.write_u8(colr.approximation)?;
                match (&colr.icc_profile, colr.colorspace) {
                    (Some(profile), _) => b.extend_from_slice(profile),
                    (None, Some(colorspace)) => b.write_u32::<BigEndian>(colorspace)?,
                    (None, None) => {
                        return Err(Error::InvalidStructure(
                            "a colour specification box needs either an \
                             enumerated colourspace or an ICC profile"
                                .into(),
                        ))
                    }
                }
            }
            BoxData::ChannelDefinition(cdef) => {
                b.write_u16::<BigEndian>(cdef.index.len() as u16)?;
                for j in 0..cdef.index.len() {
                    b.write_u16::<BigEndian>(cdef.index[j])?;
                    b.write_u16::<BigEndian>(cdef.channel_type[j])?;
                    b.write_u16::<BigEndian>(cdef.association[j])?;
                }
            }
            BoxData::Palette(pclr) => {
                b.write_u16::<BigEndian>(pclr.entries.len() as u16)?;
                b.write_u8(pclr.bits.len() as u8)?;
                for bits in &pclr.bits {
                    b.write_u8(*bits)?;
                }
                for row in &pclr.entries {
                    for (value, bits) in row.iter().zip(&pclr.bits) {
                        let width = ((bits & 0x7f) as usize + 8) / 8;
                        for k in (0..width).rev() {
                            b.write_u8((value >> (8 * k)) as u8)?;
                        }
                    }
                }
            }
            BoxData::ComponentMapping(cmap) => {
                for j in 0..cmap.component_index.len() {
                    b.write_u16::<BigEndian>(cmap.component_index[j])?;
                    b.write_u8(cmap.mapping_type[j])?;
                    b.write_u8(cmap.palette_index[j])?;
                }
            }
            BoxData::BitsPerComponent(bpcc) => {
                for j in 0..bpcc.bits_per_component.len() {
                    let mut byte = bpcc.bits_per_component[j] - 1;
                    if bpcc.signed[j] {
                        byte |= 0x80;
                    }
                    b.write_u8(byte)?;
                }
            }
            BoxData::CaptureResolution(sub) | BoxData::DisplayResolution(sub) => {
                b.write_u16::<BigEndian>(sub.vertical_numerator)?;
                b.write_u16::<BigEndian>(sub.vertical_denominator)?;
                b.write_u16::<BigEndian>(sub.horizontal_numerator)?;
                b.write_u16::<BigEndian>(sub.horizontal_denominator)?;
                b.write_i8(sub.vertical_exponent)?;
                b.write_i8(sub.horizontal_exponent)?;
            }
            BoxData::Codestream(jp2c) => match &jp2c.source {
                CodestreamSource::Memory(data) => b.extend_from_slice(data),
                CodestreamSource::Range { .. } => {
                    return Err(Error::InvalidStructure(
                        "a codestream box wrapping a file range cannot be \
                         serialized standalone; rewrap the file instead"
                            .into(),
                    ))
                }
            },
            BoxData::Xml(xml) => b.extend_from_slice(&xml.xml),
            BoxData::Uuid(uuid) => {
                b.extend_from_slice(&uuid.uuid);
                b.extend_from_slice(&uuid.data);
            }
            BoxData::UuidList(ulst) => {
                b.write_u16::<BigEndian>(ulst.uuids.len() as u16)?;
                for uuid in &ulst.uuids {
                    b.extend_from_slice(uuid);
                }
            }
            BoxData::Url(url) => {
                b.write_u8(url.version)?;
                b.extend_from_slice(&url.flags);
                b.extend_from_slice(&url.location);
            }
            BoxData::Free => {}
            BoxData::Label(lbl) => b.extend_from_slice(lbl.label.as_bytes()),
            BoxData::NumberList(nlst) => {
                for association in &nlst.associations {
                    b.write_u32::<BigEndian>(*association)?;
                }
            }
            BoxData::DataReference(children) => {
                b.write_u16::<BigEndian>(children.len() as u16)?;
                for child in children {
                    child.write(&mut b)?;
                }
            }
            BoxData::FragmentList(flst) => {
                b.write_u16::<BigEndian>(flst.fragment_offset.len() as u16)?;
                for j in 0..flst.fragment_offset.len() {
                    b.write_u64::<BigEndian>(flst.fragment_offset[j])?;
                    b.write_u32::<BigEndian>(flst.fragment_length[j])?;
                    b.write_u16::<BigEndian>(flst.data_reference[j])?;
                }
            }
            BoxData::Jp2Header(children)
            | BoxData::Resolution(children)
            | BoxData::UuidInfo(children)
            | BoxData::Association(children)
            | BoxData::FragmentTable(children)
            | BoxData::CodestreamHeader(children)
            | BoxData::CompositingLayerHeader(children)
            | BoxData::ColourGroup(children) => {
                for child in children {
                    child.write(&mut b)?;
                }
            }
            BoxData::Unknown { data, .. } => b.extend_from_slice(data),
        }
        Ok(b)
    }
}

/// Find the first box with the given id in a list
pub fn find_box(boxes: &[Jp2Box], id: FourCC) -> Option<&Jp2Box> {
    boxes.iter().find(|b| b.box_id() == id)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    pub(crate) fn minimal_jp2_boxes() -> Vec<Jp2Box> {
        vec![
            Jp2Box::new(BoxData::Signature(SignatureBox::default())),
            Jp2Box::new(BoxData::FileType(FileTypeBox::default())),
            Jp2Box::new(BoxData::Jp2Header(vec![
                Jp2Box::new(BoxData::ImageHeader(ImageHeaderBox::new(100, 200, 3))),
                Jp2Box::new(BoxData::ColourSpecification(
                    ColourSpecificationBox::enumerated(SRGB),
                )),
            ])),
            Jp2Box::new(BoxData::Codestream(ContiguousCodestreamBox::from_bytes(
                vec![0xff, 0x4f, 0xff, 0xd9],
            ))),
        ]
    }

    pub(crate) fn render(boxes: &[Jp2Box]) -> Vec<u8> {
        let mut out = Vec::new();
        for b in boxes {
            b.write(&mut out).unwrap();
        }
        out
    }

    #[test]
    fn test_round_trip_is_byte_exact() {
        let bytes = render(&minimal_jp2_boxes());

        let mut warnings = Vec::new();
        let mut cursor = Cursor::new(bytes.clone());
        let boxes = parse_superbox(&mut cursor, bytes.len() as u64, &mut warnings).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(boxes.len(), 4);

        // the parsed codestream is a range; resolve it for re-serialization
        let mut reparsed = boxes;
        if let BoxData::Codestream(jp2c) = &mut reparsed[3].data {
            if let CodestreamSource::Range { offset, length } = &jp2c.source {
                let (offset, length) = (*offset as usize, *length as usize);
                jp2c.source = CodestreamSource::Memory(bytes[offset..offset + length].to_vec());
            }
        }

        assert_eq!(render(&reparsed), bytes);
    }

    #[test]
    fn test_parse_typed_fields() {
        let bytes = render(&minimal_jp2_boxes());
        let mut warnings = Vec::new();
        let mut cursor = Cursor::new(bytes.clone());
        let boxes = parse_superbox(&mut cursor, bytes.len() as u64, &mut warnings).unwrap();

        match &boxes[1].data {
            BoxData::FileType(ftyp) => {
                assert_eq!(ftyp.brand, brands::JP2);
                assert!(ftyp.is_compatible_with(brands::JP2));
            }
            other => panic!("expected file type box, got {other:?}"),
        }

        let jp2h = &boxes[2];
        assert_eq!(jp2h.box_id(), ids::JP2_HEADER);
        let children = jp2h.children().unwrap();
        match &children[0].data {
            BoxData::ImageHeader(ihdr) => {
                assert_eq!((ihdr.height, ihdr.width, ihdr.num_components), (100, 200, 3));
                assert_eq!(ihdr.bits_per_component, 8);
                assert!(!ihdr.signed);
            }
            other => panic!("expected image header box, got {other:?}"),
        }
        match &children[1].data {
            BoxData::ColourSpecification(colr) => {
                assert_eq!(colr.method, ENUMERATED_COLORSPACE);
                assert_eq!(colr.colorspace, Some(SRGB));
            }
            other => panic!("expected colour specification box, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_length_extends_to_container_end() {
        let mut bytes = render(&minimal_jp2_boxes());
        // rewrite the last box header to the "extends to EOF" form
        let jp2c_offset = bytes.len() - 12;
        bytes[jp2c_offset..jp2c_offset + 4].copy_from_slice(&0u32.to_be_bytes());

        let mut warnings = Vec::new();
        let mut cursor = Cursor::new(bytes.clone());
        let boxes = parse_superbox(&mut cursor, bytes.len() as u64, &mut warnings).unwrap();
        let jp2c = boxes.last().unwrap();
        assert_eq!(jp2c.box_id(), ids::CODESTREAM);
        assert_eq!(jp2c.length, 12);
    }

    #[test]
    fn test_extended_length_parse() {
        // a uuid box written with the 16-byte header form
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(b"uuid");
        bytes.extend_from_slice(&36u64.to_be_bytes());
        bytes.extend_from_slice(&XMP_UUID);
        bytes.extend_from_slice(b"abcd");

        let mut warnings = Vec::new();
        let mut cursor = Cursor::new(bytes.clone());
        let boxes = parse_superbox(&mut cursor, bytes.len() as u64, &mut warnings).unwrap();
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].length, 36);
        match &boxes[0].data {
            BoxData::Uuid(uuid) => {
                assert!(uuid.is_xmp());
                assert_eq!(uuid.data, b"abcd");
            }
            other => panic!("expected uuid box, got {other:?}"),
        }
    }

    #[test]
    fn test_header_write_selects_extended_form() {
        // headers for huge bodies switch to the 64-bit length field
        let mut small = Vec::new();
        assert_eq!(write_box_header(&mut small, ids::CODESTREAM, 100).unwrap(), 8);
        assert_eq!(&small[0..4], &108u32.to_be_bytes());

        let mut large = Vec::new();
        let body_len = 0xFFFF_FFFFu64; // body alone exceeds the 32-bit field
        assert_eq!(
            write_box_header(&mut large, ids::CODESTREAM, body_len).unwrap(),
            16
        );
        assert_eq!(&large[0..4], &1u32.to_be_bytes());
        assert_eq!(&large[4..8], b"jp2c");
        assert_eq!(&large[8..16], &(body_len + 16).to_be_bytes());
    }

    #[test]
    fn test_unknown_box_is_tolerated() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&12u32.to_be_bytes());
        bytes.extend_from_slice(b"zzzz");
        bytes.extend_from_slice(b"data");

        let mut warnings = Vec::new();
        let mut cursor = Cursor::new(bytes.clone());
        let boxes = parse_superbox(&mut cursor, bytes.len() as u64, &mut warnings).unwrap();
        assert_eq!(boxes.len(), 1);
        assert!(matches!(
            warnings.as_slice(),
            [StructuralWarning::UnrecognizedBox { .. }]
        ));
        match &boxes[0].data {
            BoxData::Unknown { id, data } => {
                assert_eq!(*id, FourCC(*b"zzzz"));
                assert_eq!(data, b"data");
            }
            other => panic!("expected unknown box, got {other:?}"),
        }
    }

    #[test]
    fn test_trailing_garbage_is_a_warning() {
        let mut bytes = render(&minimal_jp2_boxes());
        bytes.extend_from_slice(&[0u8; 3]);

        let mut warnings = Vec::new();
        let mut cursor = Cursor::new(bytes.clone());
        let boxes = parse_superbox(&mut cursor, bytes.len() as u64, &mut warnings).unwrap();
        assert_eq!(boxes.len(), 4);
        assert!(warnings
            .iter()
            .any(|w| matches!(w, StructuralWarning::TrailingBytes { count: 3 })));
    }
}
