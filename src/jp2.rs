//! Reading and rewriting JPEG 2000 files
//!
//! [`Jp2File`] is the file-level entry point: it detects raw codestreams vs
//! boxed containers, parses the box tree, runs the structural checks, and
//! offers the two mutation paths the format allows:
//! - appending boxes (UUID metadata), which preserves every existing byte
//!   offset, done in append mode;
//! - rewrapping into a new jacket, which shifts offsets and therefore writes
//!   to a temp file that atomically replaces the destination.
//!
//! File handles are scoped to single operations; nothing is held open
//! across the wrap/append sequence.

use crate::boxes::{
    self, ids, BoxData, ColourSpecificationBox, ContiguousCodestreamBox, CodestreamSource,
    FileTypeBox, FourCC, ImageHeaderBox, Jp2Box, SignatureBox, UuidBox, GREYSCALE, SRGB,
};
use crate::codestream::{Codestream, ParseOptions};
use crate::error::{Error, Result, StructuralWarning};
use crate::validate::{self, Mode};
use std::fs::{File, OpenOptions};
use std::io::{copy, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A JPEG 2000 file: box tree, codestream access, append and rewrap
#[derive(Debug)]
pub struct Jp2File {
    path: PathBuf,
    length: u64,
    raw_codestream: bool,
    boxes: Vec<Jp2Box>,
    warnings: Vec<StructuralWarning>,
}

impl Jp2File {
    /// Open and parse a JPEG 2000 file
    ///
    /// Accepts both boxed containers and bare codestreams. Structural rule
    /// violations abort; lesser findings are collected in
    /// [`Jp2File::warnings`] and logged.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let length = file.metadata()?.len();

        let mut magic = [0u8; 2];
        file.read_exact(&mut magic)?;
        if magic == [0xff, 0x4f] {
            // a raw codestream, no boxes to parse
            return Ok(Self {
                path,
                length,
                raw_codestream: true,
                boxes: Vec::new(),
                warnings: Vec::new(),
            });
        }

        // the file must open with the 12-byte signature box
        file.seek(SeekFrom::Start(0))?;
        let mut opening = [0u8; 12];
        file.read_exact(&mut opening)?;
        if opening[0..4] != [0, 0, 0, 12]
            || &opening[4..8] != b"jP  "
            || opening[8..12] != boxes::SIGNATURE_PAYLOAD
        {
            return Err(Error::InvalidStructure(format!(
                "{} is not a JPEG 2000 file",
                path.display()
            )));
        }

        file.seek(SeekFrom::Start(0))?;
        let mut warnings = Vec::new();
        let parsed = boxes::parse_superbox(&mut file, length, &mut warnings)?;
        warnings.extend(validate::validate(&parsed, Mode::Reading)?);

        let mut jp2 = Self {
            path,
            length,
            raw_codestream: false,
            boxes: parsed,
            warnings,
        };

        // the image header must agree with the codestream geometry
        if let Some(warning) = jp2.check_dimensions(&mut file)? {
            log::warn!("{warning}");
            jp2.warnings.push(warning);
        }

        Ok(jp2)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total file length in bytes
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn is_raw_codestream(&self) -> bool {
        self.raw_codestream
    }

    /// Top-level boxes, empty for a raw codestream
    pub fn boxes(&self) -> &[Jp2Box] {
        &self.boxes
    }

    /// Non-fatal findings collected while opening
    pub fn warnings(&self) -> &[StructuralWarning] {
        &self.warnings
    }

    /// The image header box, if this is a boxed file
    pub fn image_header(&self) -> Option<&ImageHeaderBox> {
        let jp2h = boxes::find_box(&self.boxes, ids::JP2_HEADER)?;
        jp2h.children()?.iter().find_map(|b| match &b.data {
            BoxData::ImageHeader(ihdr) => Some(ihdr),
            _ => None,
        })
    }

    /// The first codestream box
    pub fn codestream_box(&self) -> Option<&ContiguousCodestreamBox> {
        self.boxes.iter().find_map(|b| match &b.data {
            BoxData::Codestream(jp2c) => Some(jp2c),
            _ => None,
        })
    }

    /// UUID boxes in the file
    pub fn uuid_boxes(&self) -> Vec<&UuidBox> {
        self.boxes
            .iter()
            .filter_map(|b| match &b.data {
                BoxData::Uuid(uuid) => Some(uuid),
                _ => None,
            })
            .collect()
    }

    /// Byte range of the raw codestream within this file
    fn codestream_range(&self) -> Result<(u64, u64)> {
        if self.raw_codestream {
            return Ok((0, self.length));
        }
        let jp2c = self.codestream_box().ok_or_else(|| {
            Error::InvalidStructure("the file has no codestream box".into())
        })?;
        match &jp2c.source {
            CodestreamSource::Range { offset, length } => Ok((*offset, *length)),
            CodestreamSource::Memory(_) => Err(Error::InvalidStructure(
                "the codestream box is not backed by this file".into(),
            )),
        }
    }

    /// Parse the codestream's main header
    pub fn codestream(&self) -> Result<Codestream> {
        self.codestream_with_options(&ParseOptions::default())
    }

    /// Parse the codestream, optionally walking every tile-part header
    pub fn codestream_with_options(&self, options: &ParseOptions) -> Result<Codestream> {
        let (offset, length) = self.codestream_range()?;
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        Codestream::parse(&mut file, length, options)
    }

    /// Image shape as (height, width, components)
    pub fn shape(&self) -> Result<(u32, u32, u16)> {
        if let Some(ihdr) = self.image_header() {
            return Ok((ihdr.height, ihdr.width, ihdr.num_components));
        }
        let codestream = self.codestream()?;
        let siz = codestream.siz().ok_or_else(|| Error::InvalidCodestream {
            offset: codestream.offset,
            reason: "the main header has no SIZ segment".into(),
        })?;
        Ok((siz.ysiz, siz.xsiz, siz.num_components()))
    }

    fn check_dimensions<R: Read + Seek>(
        &self,
        reader: &mut R,
    ) -> Result<Option<StructuralWarning>> {
        let Some(ihdr) = self.image_header() else {
            return Ok(None);
        };
        let (offset, length) = self.codestream_range()?;
        reader.seek(SeekFrom::Start(offset))?;
        let codestream = Codestream::parse(reader, length, &ParseOptions::default())?;
        let Some(siz) = codestream.siz() else {
            return Ok(None);
        };
        Ok(validate::cross_check_dimensions(ihdr, siz))
    }

    /// Append a UUID box to the end of the file
    ///
    /// Appending never disturbs existing byte offsets, so no rewrap is
    /// needed. The write is not atomic: a crash mid-append leaves a trailing
    /// box whose length field disagrees with the file size, which the next
    /// parse reports.
    pub fn append_uuid_box(&self, uuid: [u8; 16], payload: Vec<u8>) -> Result<()> {
        let uuid_box = Jp2Box::new(BoxData::Uuid(UuidBox {
            uuid,
            data: payload,
        }));
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        uuid_box.write(&mut file)?;
        file.flush()?;
        Ok(())
    }

    /// Build the default jacket for this file's codestream
    ///
    /// Signature, file type, header (image header + colour specification),
    /// codestream. Geometry comes from the SIZ segment; three components get
    /// sRGB, anything else greyscale.
    pub fn default_jacket(&self) -> Result<Vec<Jp2Box>> {
        let codestream = self.codestream()?;
        let siz = codestream.siz().ok_or_else(|| Error::InvalidCodestream {
            offset: codestream.offset,
            reason: "the main header has no SIZ segment".into(),
        })?;

        let mut ihdr = ImageHeaderBox::new(siz.ysiz, siz.xsiz, siz.num_components());
        ihdr.bits_per_component = siz.bitdepth.first().copied().unwrap_or(8);
        ihdr.signed = siz.signed.first().copied().unwrap_or(false);

        let colorspace = if siz.num_components() == 3 {
            SRGB
        } else {
            GREYSCALE
        };

        Ok(vec![
            Jp2Box::new(BoxData::Signature(SignatureBox::default())),
            Jp2Box::new(BoxData::FileType(FileTypeBox::default())),
            Jp2Box::new(BoxData::Jp2Header(vec![
                Jp2Box::new(BoxData::ImageHeader(ihdr)),
                Jp2Box::new(BoxData::ColourSpecification(
                    ColourSpecificationBox::enumerated(colorspace),
                )),
            ])),
            Jp2Box::new(BoxData::Codestream(ContiguousCodestreamBox {
                source: CodestreamSource::Range {
                    offset: 0,
                    length: 0,
                },
            })),
        ])
    }

    /// Rewrap the codestream into a new jacket at `destination`
    ///
    /// The jacket is validated strictly before anything is written. The
    /// codestream box streams straight from this file. The output is
    /// written to a temp file next to the destination and moved into place,
    /// so a crash mid-write cannot leave a half-written destination.
    pub fn wrap<P: AsRef<Path>>(
        &self,
        destination: P,
        jacket: Option<Vec<Jp2Box>>,
    ) -> Result<Jp2File> {
        let destination = destination.as_ref();
        let jacket = match jacket {
            Some(jacket) => jacket,
            None => self.default_jacket()?,
        };

        validate::validate(&jacket, Mode::Writing)?;

        let tmp_path = destination.with_extension("tmp");
        {
            let mut out = File::create(&tmp_path)?;
            let mut source = File::open(&self.path)?;

            for b in &jacket {
                if b.box_id() == ids::CODESTREAM {
                    self.write_codestream_box(b, &mut source, &mut out)?;
                } else {
                    b.write(&mut out)?;
                }
            }
            out.flush()?;
        }
        std::fs::rename(&tmp_path, destination)?;

        Jp2File::open(destination)
    }

    /// Write a codestream box, streaming the payload from the source file
    fn write_codestream_box<W: Write>(
        &self,
        jp2c: &Jp2Box,
        source: &mut File,
        out: &mut W,
    ) -> Result<()> {
        match &jp2c.data {
            BoxData::Codestream(ContiguousCodestreamBox {
                source: CodestreamSource::Memory(data),
            }) => {
                boxes::write_box_header(out, ids::CODESTREAM, data.len() as u64)?;
                out.write_all(data)?;
            }
            BoxData::Codestream(_) => {
                // stream this file's own codestream range
                let (offset, length) = self.codestream_range()?;
                boxes::write_box_header(out, ids::CODESTREAM, length)?;
                source.seek(SeekFrom::Start(offset))?;
                copy(&mut source.take(length), out)?;
            }
            _ => {
                return Err(Error::InvalidStructure(format!(
                    "expected a codestream box, found '{}'",
                    jp2c.box_id()
                )))
            }
        }
        Ok(())
    }
}

/// Interpret an EXIF or GeoTIFF UUID box payload as an IFD
///
/// The EXIF UUID payload usually starts with `EXIF\0\0` before the TIFF
/// header; some files omit the lead-in, which is tolerated.
pub fn interpret_uuid_ifd(uuid_box: &UuidBox) -> Result<crate::tiff::Ifd> {
    let payload: &[u8] = if uuid_box.data.len() >= 6
        && uuid_box.data[0..4].eq_ignore_ascii_case(b"exif")
    {
        &uuid_box.data[6..]
    } else {
        &uuid_box.data
    };

    let mut cursor = std::io::Cursor::new(payload);
    let header = crate::tiff::read_tiff_header(&mut cursor)?;
    crate::tiff::read_ifd(&mut cursor, &header)
}

/// Map a FourCC to a short human-readable box description
pub fn box_long_name(id: FourCC) -> &'static str {
    match id {
        ids::SIGNATURE => "JPEG 2000 Signature",
        ids::FILE_TYPE => "File Type",
        ids::JP2_HEADER => "JP2 Header",
        ids::IMAGE_HEADER => "Image Header",
        ids::COLOUR_SPECIFICATION => "Colour Specification",
        ids::BITS_PER_COMPONENT => "Bits Per Component",
        ids::PALETTE => "Palette",
        ids::COMPONENT_MAPPING => "Component Mapping",
        ids::CHANNEL_DEFINITION => "Channel Definition",
        ids::RESOLUTION => "Resolution",
        ids::CAPTURE_RESOLUTION => "Capture Resolution",
        ids::DISPLAY_RESOLUTION => "Default Display Resolution",
        ids::CODESTREAM => "Contiguous Codestream",
        ids::XML => "XML",
        ids::UUID => "UUID",
        ids::UUID_INFO => "UUID Info",
        ids::UUID_LIST => "UUID List",
        ids::URL => "Data Entry URL",
        ids::FREE => "Free",
        ids::LABEL => "Label",
        ids::ASSOCIATION => "Association",
        ids::NUMBER_LIST => "Number List",
        ids::DATA_REFERENCE => "Data Reference",
        ids::FRAGMENT_TABLE => "Fragment Table",
        ids::FRAGMENT_LIST => "Fragment List",
        ids::CODESTREAM_HEADER => "Codestream Header",
        ids::COMPOSITING_LAYER_HEADER => "Compositing Layer Header",
        ids::COLOUR_GROUP => "Colour Group",
        _ => "Unknown",
    }
}
