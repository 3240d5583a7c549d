//! Converting other container formats into JPEG 2000
//!
//! The pixel path is not here: an external encoder produces the codestream.
//! This module does the metadata transplant around it, lifting EXIF/GeoTIFF
//! IFDs, XMP packets, and ICC profiles out of a TIFF or JPEG source and
//! repackaging them in the JP2 container:
//! - the IFD is rewritten as a classic little-endian TIFF buffer inside an
//!   EXIF or GeoTIFF UUID box, appended to the file;
//! - an XMP packet goes into its own UUID box, also appended;
//! - an ICC profile replaces the colour specification box, which shifts
//!   offsets and therefore forces a full rewrap.
//!
//! Ordering matters: the ICC rewrap rewrites the whole file, so it runs
//! before the append-only UUID steps, which rely on stable offsets.

use crate::boxes::{
    ids, BoxData, ColourSpecificationBox, Jp2Box, EXIF_UUID, GEOTIFF_UUID, XMP_UUID,
};
use crate::error::{Error, Result};
use crate::format::SourceFormat;
use crate::jp2::Jp2File;
use crate::tiff::{self, tags, Ifd};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;

/// The APP1 namespace prefix identifying an XMP segment in a JPEG file
const XMP_APP1_PREFIX: &[u8] = b"http://ns.adobe.com/xap/1.0/";

/// Pixel-layout tags that make no sense once the pixels live in a
/// codestream; they are always withheld from the rewritten IFD
const LAYOUT_TAGS: [u16; 8] = [
    tags::STRIP_OFFSETS,
    tags::STRIP_BYTE_COUNTS,
    tags::ROWS_PER_STRIP,
    tags::TILE_WIDTH,
    tags::TILE_LENGTH,
    tags::TILE_OFFSETS,
    tags::TILE_BYTE_COUNTS,
    tags::JPEG_TABLES,
];

/// What to carry over during a conversion
///
/// The default keeps the EXIF and XMP UUID boxes and leaves ICC profiles
/// alone.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    create_exif_uuid: bool,
    create_xmp_uuid: bool,
    include_icc_profile: bool,
    exclude_tags: Vec<u16>,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            create_exif_uuid: true,
            create_xmp_uuid: true,
            include_icc_profile: false,
            exclude_tags: Vec::new(),
        }
    }
}

impl ConvertOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether to append an EXIF/GeoTIFF UUID box carrying the source IFD
    pub fn exif_uuid(mut self, create: bool) -> Self {
        self.create_exif_uuid = create;
        self
    }

    /// Whether to append an XMP UUID box when the source carries a packet
    pub fn xmp_uuid(mut self, create: bool) -> Self {
        self.create_xmp_uuid = create;
        self
    }

    /// Whether to rewrap the file around a captured ICC profile
    pub fn icc_profile(mut self, include: bool) -> Self {
        self.include_icc_profile = include;
        self
    }

    /// IFD tag numbers to withhold from the rewritten metadata
    pub fn exclude_tags(mut self, tags: Vec<u16>) -> Self {
        self.exclude_tags = tags;
        self
    }

    fn all_excluded_tags(&self) -> Vec<u16> {
        let mut excluded = LAYOUT_TAGS.to_vec();
        excluded.extend_from_slice(&self.exclude_tags);
        excluded
    }
}

/// Metadata lifted from a TIFF or JPEG source
#[derive(Debug, Default)]
pub struct CapturedMetadata {
    pub ifd: Option<Ifd>,
    pub xmp: Option<Vec<u8>>,
    pub icc_profile: Option<Vec<u8>>,
}

/// Read the main IFD and its embedded metadata out of a TIFF file
pub fn capture_tiff_metadata<P: AsRef<Path>>(path: P) -> Result<CapturedMetadata> {
    let mut file = File::open(path.as_ref())?;
    let header = tiff::read_tiff_header(&mut file)?;
    let ifd = tiff::read_ifd(&mut file, &header)?;

    let xmp = ifd.byte_payload(tags::XML_PACKET);
    let icc_profile = ifd.byte_payload(tags::ICC_PROFILE);

    Ok(CapturedMetadata {
        ifd: Some(ifd),
        xmp,
        icc_profile,
    })
}

/// Scan a JPEG's application segments for EXIF, XMP, and ICC metadata
///
/// The scan stops at the first marker that is not an application segment;
/// metadata never follows the entropy-coded data.
pub fn capture_jpeg_metadata<P: AsRef<Path>>(path: P) -> Result<CapturedMetadata> {
    let mut file = File::open(path.as_ref())?;
    let mut captured = CapturedMetadata::default();
    let mut icc_chunks: Vec<u8> = Vec::new();

    let soi = file.read_u16::<BigEndian>()?;
    if soi != 0xFFD8 {
        return Err(Error::UnsupportedFormat);
    }

    loop {
        let marker = match file.read_u16::<BigEndian>() {
            Ok(marker) => marker,
            Err(_) => break,
        };

        match marker {
            // APP0 (JFIF), APP12 (ducky), APP14 (Adobe): nothing for us
            0xFFE0 | 0xFFEC | 0xFFEE => {
                skip_segment(&mut file)?;
            }
            0xFFE1 => {
                let buffer = read_segment(&mut file)?;
                if buffer.starts_with(b"Exif\0\0") {
                    let mut cursor = Cursor::new(&buffer[6..]);
                    let header = tiff::read_tiff_header(&mut cursor)?;
                    captured.ifd = Some(tiff::read_ifd(&mut cursor, &header)?);
                } else if buffer.starts_with(XMP_APP1_PREFIX) {
                    captured.xmp = Some(buffer[XMP_APP1_PREFIX.len() + 1..].to_vec());
                } else {
                    log::warn!("unrecognized APP1 segment ignored");
                }
            }
            0xFFE2 => {
                let buffer = read_segment(&mut file)?;
                if buffer.starts_with(b"ICC_PROFILE\0") {
                    // chunk index and count precede the data; chunks arrive
                    // in order
                    icc_chunks.extend_from_slice(&buffer[14..]);
                }
            }
            _ => break,
        }
    }

    if !icc_chunks.is_empty() {
        captured.icc_profile = Some(icc_chunks);
    }

    Ok(captured)
}

fn read_segment(file: &mut File) -> Result<Vec<u8>> {
    let size = file.read_u16::<BigEndian>()?;
    if size < 2 {
        return Err(Error::InvalidStructure(
            "JPEG segment length is too small".into(),
        ));
    }
    crate::stream::read_exact(file, size as usize - 2)
}

fn skip_segment(file: &mut File) -> Result<()> {
    let size = file.read_u16::<BigEndian>()?;
    file.seek(SeekFrom::Current(size as i64 - 2))?;
    Ok(())
}

/// Build the synthetic TIFF buffer that goes inside an EXIF/GeoTIFF UUID
///
/// Always a classic little-endian header, whatever the source layout was.
fn build_ifd_buffer(ifd: &Ifd, exclude: &[u16]) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    buffer.get_mut().extend_from_slice(b"II");
    buffer.get_mut().write_u16::<LittleEndian>(42)?;
    buffer.get_mut().write_u32::<LittleEndian>(8)?;
    buffer.set_position(8);
    tiff::write_ifd(&mut buffer, ifd, exclude)?;
    Ok(buffer.into_inner())
}

/// Append an EXIF or GeoTIFF UUID box carrying the IFD metadata
///
/// An IFD that carries a GeoTIFF key directory selects the GeoTIFF UUID and
/// a bare TIFF buffer; anything else gets the generic EXIF UUID with the
/// `EXIF\0\0` lead-in.
pub fn append_exif_uuid(jp2: &Jp2File, ifd: &Ifd, exclude: &[u16]) -> Result<()> {
    let buffer = build_ifd_buffer(ifd, exclude)?;

    let (uuid, payload) = if ifd.has_geotiff_tags() {
        (GEOTIFF_UUID, buffer)
    } else {
        let mut payload = b"EXIF\0\0".to_vec();
        payload.extend_from_slice(&buffer);
        (EXIF_UUID, payload)
    };

    jp2.append_uuid_box(uuid, payload)
}

/// Append an XMP UUID box carrying the packet bytes
pub fn append_xmp_uuid(jp2: &Jp2File, packet: Vec<u8>) -> Result<()> {
    #[cfg(feature = "xmp")]
    if !crate::xmp::is_well_formed(&packet) {
        log::warn!("the XMP packet is not well-formed XML");
    }

    jp2.append_uuid_box(XMP_UUID, packet)
}

/// Rewrap a file so its colour specification carries an ICC profile
///
/// Offsets shift, so the whole file is rewritten in place via the temp-file
/// pattern. The header keeps its image header box; every other colour
/// specification is replaced by the profile-bearing one.
pub fn rewrap_with_icc_profile(jp2: &Jp2File, icc_profile: Vec<u8>) -> Result<Jp2File> {
    // refuse profiles that do not even have a plausible header
    crate::icc::IccProfileHeader::parse(&icc_profile)?;

    let colr = Jp2Box::new(BoxData::ColourSpecification(
        ColourSpecificationBox::with_icc_profile(icc_profile),
    ));

    let mut jacket = jp2.boxes().to_vec();
    let jp2h = jacket
        .iter_mut()
        .find(|b| b.box_id() == ids::JP2_HEADER)
        .ok_or_else(|| Error::InvalidStructure("the file has no JP2 header box".into()))?;

    if let BoxData::Jp2Header(children) = &mut jp2h.data {
        let ihdr = children
            .first()
            .filter(|b| b.box_id() == ids::IMAGE_HEADER)
            .cloned()
            .ok_or_else(|| {
                Error::InvalidStructure("the JP2 header box has no image header".into())
            })?;
        *children = vec![ihdr, colr];
    }

    let destination = jp2.path().to_path_buf();
    jp2.wrap(&destination, Some(jacket))
}

/// The converter: transplant metadata around an externally produced
/// codestream
#[derive(Debug, Default)]
pub struct Converter {
    options: ConvertOptions,
}

impl Converter {
    pub fn new(options: ConvertOptions) -> Self {
        Self { options }
    }

    /// Capture metadata from `metadata_source`, wrap `codestream_path` into
    /// a JP2 container at `destination`, and carry the metadata over
    ///
    /// `codestream_path` may be a raw codestream or an existing boxed file;
    /// `metadata_source` is sniffed as TIFF or JPEG.
    pub fn convert<P, Q, R>(
        &self,
        codestream_path: P,
        metadata_source: Option<Q>,
        destination: R,
    ) -> Result<Jp2File>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
        R: AsRef<Path>,
    {
        let metadata = match metadata_source {
            Some(source) => self.capture(source.as_ref())?,
            None => CapturedMetadata::default(),
        };

        let source = Jp2File::open(codestream_path.as_ref())?;
        let mut jp2 = source.wrap(destination.as_ref(), None)?;

        jp2 = self.apply(jp2, metadata)?;
        Ok(jp2)
    }

    /// Apply captured metadata to an already wrapped file
    ///
    /// Rewrap-based steps run first, append-only steps last.
    pub fn apply(&self, mut jp2: Jp2File, metadata: CapturedMetadata) -> Result<Jp2File> {
        if self.options.include_icc_profile {
            match metadata.icc_profile {
                Some(profile) => {
                    log::info!("consuming an ICC profile into the colour specification box");
                    jp2 = rewrap_with_icc_profile(&jp2, profile)?;
                }
                None => log::warn!("no ICC profile was found"),
            }
        }

        if self.options.create_exif_uuid {
            if let Some(ifd) = &metadata.ifd {
                append_exif_uuid(&jp2, ifd, &self.options.all_excluded_tags())?;
            }
        }

        if self.options.create_xmp_uuid {
            if let Some(packet) = metadata.xmp {
                append_xmp_uuid(&jp2, packet)?;
            }
        }

        // pick up everything the append steps added
        Jp2File::open(jp2.path())
    }

    fn capture(&self, source: &Path) -> Result<CapturedMetadata> {
        let file = File::open(source)?;
        let mut header = Vec::with_capacity(12);
        file.take(12).read_to_end(&mut header)?;

        match SourceFormat::detect(&header) {
            Some(SourceFormat::Tiff) => capture_tiff_metadata(source),
            Some(SourceFormat::Jpeg) => capture_jpeg_metadata(source),
            _ => Err(Error::UnsupportedFormat),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codestream::tests::synthetic_codestream;
    use crate::jp2::interpret_uuid_ifd;
    use crate::tiff::{dtypes, IfdEntry, IfdPayload, IfdValue};

    fn entry(dtype: u16, count: u64, values: Vec<IfdValue>) -> IfdEntry {
        IfdEntry {
            dtype,
            count,
            payload: IfdPayload::Values(values),
        }
    }

    fn ascii_entry(text: &[u8]) -> IfdEntry {
        entry(
            dtypes::ASCII,
            text.len() as u64,
            text.iter().map(|b| IfdValue::Unsigned(*b as u64)).collect(),
        )
    }

    /// write a classic little-endian TIFF whose main IFD carries `ifd`
    fn write_tiff(dir: &tempfile::TempDir, ifd: &Ifd) -> std::path::PathBuf {
        let buffer = build_ifd_buffer(ifd, &[]).unwrap();
        let path = dir.path().join("source.tif");
        std::fs::write(&path, buffer).unwrap();
        path
    }

    fn write_raw_codestream(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("encoded.j2k");
        std::fs::write(&path, synthetic_codestream(200, 100, 3)).unwrap();
        path
    }

    #[test]
    fn test_exif_uuid_selection_without_geotiff() {
        let dir = tempfile::tempdir().unwrap();
        let mut ifd = Ifd::default();
        ifd.insert(tags::MAKE, ascii_entry(b"camera co\0"));
        let tiff_path = write_tiff(&dir, &ifd);
        let codestream_path = write_raw_codestream(&dir);
        let dest = dir.path().join("out.jp2");

        let jp2 = Converter::new(ConvertOptions::new())
            .convert(&codestream_path, Some(&tiff_path), &dest)
            .unwrap();

        let uuids = jp2.uuid_boxes();
        assert_eq!(uuids.len(), 1);
        assert!(uuids[0].is_exif());
        assert!(uuids[0].data.starts_with(b"EXIF\0\0"));

        let decoded = interpret_uuid_ifd(uuids[0]).unwrap();
        assert_eq!(decoded.ascii_payload(tags::MAKE).unwrap(), "camera co");
    }

    #[test]
    fn test_geotiff_uuid_selection() {
        let dir = tempfile::tempdir().unwrap();
        let mut ifd = Ifd::default();
        ifd.insert(
            tags::GEO_KEY_DIRECTORY,
            entry(
                dtypes::SHORT,
                4,
                vec![
                    IfdValue::Unsigned(1),
                    IfdValue::Unsigned(1),
                    IfdValue::Unsigned(0),
                    IfdValue::Unsigned(0),
                ],
            ),
        );
        let tiff_path = write_tiff(&dir, &ifd);
        let codestream_path = write_raw_codestream(&dir);
        let dest = dir.path().join("out.jp2");

        let jp2 = Converter::new(ConvertOptions::new())
            .convert(&codestream_path, Some(&tiff_path), &dest)
            .unwrap();

        let uuids = jp2.uuid_boxes();
        assert_eq!(uuids.len(), 1);
        assert!(uuids[0].is_geotiff());
        // the GeoTIFF payload is a bare TIFF buffer, no EXIF lead-in
        assert!(uuids[0].data.starts_with(b"II"));
    }

    #[test]
    fn test_layout_tags_are_withheld() {
        let dir = tempfile::tempdir().unwrap();
        let mut ifd = Ifd::default();
        ifd.insert(
            tags::IMAGE_WIDTH,
            entry(dtypes::LONG, 1, vec![IfdValue::Unsigned(200)]),
        );
        ifd.insert(
            tags::STRIP_OFFSETS,
            entry(dtypes::LONG, 1, vec![IfdValue::Unsigned(4096)]),
        );
        let tiff_path = write_tiff(&dir, &ifd);
        let codestream_path = write_raw_codestream(&dir);
        let dest = dir.path().join("out.jp2");

        let jp2 = Converter::new(ConvertOptions::new())
            .convert(&codestream_path, Some(&tiff_path), &dest)
            .unwrap();

        let decoded = interpret_uuid_ifd(jp2.uuid_boxes()[0]).unwrap();
        assert!(decoded.get(tags::IMAGE_WIDTH).is_some());
        assert!(decoded.get(tags::STRIP_OFFSETS).is_none());
    }

    #[test]
    fn test_xmp_from_tiff_tag() {
        let dir = tempfile::tempdir().unwrap();
        let packet = b"<x:xmpmeta xmlns:x=\"adobe:ns:meta/\"/>";
        let mut ifd = Ifd::default();
        ifd.insert(
            tags::XML_PACKET,
            entry(
                dtypes::BYTE,
                packet.len() as u64,
                packet.iter().map(|b| IfdValue::Unsigned(*b as u64)).collect(),
            ),
        );
        let tiff_path = write_tiff(&dir, &ifd);
        let codestream_path = write_raw_codestream(&dir);
        let dest = dir.path().join("out.jp2");

        let jp2 = Converter::new(ConvertOptions::new())
            .convert(&codestream_path, Some(&tiff_path), &dest)
            .unwrap();

        let xmp: Vec<_> = jp2.uuid_boxes().into_iter().filter(|u| u.is_xmp()).collect();
        assert_eq!(xmp.len(), 1);
        assert_eq!(xmp[0].data, packet);
    }

    #[test]
    fn test_disabled_uuids_produce_plain_wrap() {
        let dir = tempfile::tempdir().unwrap();
        let mut ifd = Ifd::default();
        ifd.insert(tags::MAKE, ascii_entry(b"camera co\0"));
        let tiff_path = write_tiff(&dir, &ifd);
        let codestream_path = write_raw_codestream(&dir);
        let dest = dir.path().join("out.jp2");

        let options = ConvertOptions::new().exif_uuid(false).xmp_uuid(false);
        let jp2 = Converter::new(options)
            .convert(&codestream_path, Some(&tiff_path), &dest)
            .unwrap();

        assert!(jp2.uuid_boxes().is_empty());
    }

    #[test]
    fn test_icc_rewrap() {
        let dir = tempfile::tempdir().unwrap();
        let codestream_path = write_raw_codestream(&dir);
        let dest = dir.path().join("out.jp2");

        let source = Jp2File::open(&codestream_path).unwrap();
        let jp2 = source.wrap(&dest, None).unwrap();

        let profile = crate::icc::tests::synthetic_profile();
        let rewrapped = rewrap_with_icc_profile(&jp2, profile.clone()).unwrap();

        let jp2h = crate::boxes::find_box(rewrapped.boxes(), ids::JP2_HEADER).unwrap();
        let colr = jp2h
            .children()
            .unwrap()
            .iter()
            .find_map(|b| match &b.data {
                BoxData::ColourSpecification(colr) => Some(colr),
                _ => None,
            })
            .unwrap();
        assert_eq!(colr.method, crate::boxes::RESTRICTED_ICC_PROFILE);
        assert_eq!(colr.icc_profile.as_deref(), Some(profile.as_slice()));

        // the codestream survived both wraps intact
        let original = std::fs::read(&codestream_path).unwrap();
        let codestream = rewrapped.codestream().unwrap();
        assert_eq!(codestream.length, original.len() as u64);
    }

    #[test]
    fn test_icc_rewrap_rejects_garbage_profile() {
        let dir = tempfile::tempdir().unwrap();
        let codestream_path = write_raw_codestream(&dir);
        let dest = dir.path().join("out.jp2");

        let source = Jp2File::open(&codestream_path).unwrap();
        let jp2 = source.wrap(&dest, None).unwrap();

        assert!(rewrap_with_icc_profile(&jp2, vec![0u8; 16]).is_err());
    }

    #[test]
    fn test_capture_jpeg_metadata() {
        use byteorder::WriteBytesExt;

        let dir = tempfile::tempdir().unwrap();

        // APP1 Exif payload: lead-in plus a one-tag TIFF buffer
        let mut ifd = Ifd::default();
        ifd.insert(
            tags::IMAGE_WIDTH,
            entry(dtypes::LONG, 1, vec![IfdValue::Unsigned(640)]),
        );
        let tiff_buffer = build_ifd_buffer(&ifd, &[]).unwrap();
        let mut exif_payload = b"Exif\0\0".to_vec();
        exif_payload.extend_from_slice(&tiff_buffer);

        let mut xmp_payload = XMP_APP1_PREFIX.to_vec();
        xmp_payload.push(0);
        xmp_payload.extend_from_slice(b"<x/>");

        let mut icc_payload = b"ICC_PROFILE\0".to_vec();
        icc_payload.push(1); // chunk 1
        icc_payload.push(1); // of 1
        icc_payload.extend_from_slice(&crate::icc::tests::synthetic_profile());

        let mut jpeg = Vec::new();
        jpeg.write_u16::<BigEndian>(0xFFD8).unwrap();
        for (marker, payload) in [
            (0xFFE1u16, &exif_payload),
            (0xFFE1, &xmp_payload),
            (0xFFE2, &icc_payload),
        ] {
            jpeg.write_u16::<BigEndian>(marker).unwrap();
            jpeg.write_u16::<BigEndian>(payload.len() as u16 + 2).unwrap();
            jpeg.extend_from_slice(payload);
        }
        jpeg.write_u16::<BigEndian>(0xFFDA).unwrap(); // start of scan, stop here

        let path = dir.path().join("source.jpg");
        std::fs::write(&path, jpeg).unwrap();

        let captured = capture_jpeg_metadata(&path).unwrap();
        let ifd = captured.ifd.unwrap();
        assert_eq!(
            ifd.get(tags::IMAGE_WIDTH).unwrap().values().unwrap(),
            &[IfdValue::Unsigned(640)]
        );
        assert_eq!(captured.xmp.as_deref(), Some(b"<x/>".as_slice()));
        assert_eq!(
            captured.icc_profile.as_deref(),
            Some(crate::icc::tests::synthetic_profile().as_slice())
        );
    }
}
