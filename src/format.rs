//! Source format detection
//!
//! Sniffs the leading bytes of a file to decide how to treat it: a boxed
//! JPEG 2000 container, a bare codestream, or one of the metadata source
//! formats the converter accepts.

/// Formats this crate can recognize from magic bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// JP2/JPX container (signature box first)
    Jp2,
    /// bare JPEG 2000 codestream (starts at SOC)
    J2k,
    /// TIFF or BigTIFF
    Tiff,
    /// JPEG (JFIF/EXIF)
    Jpeg,
}

impl SourceFormat {
    /// Detect a format from the first bytes of a file
    ///
    /// Needs at least 12 bytes for a confident JP2 answer; fewer bytes can
    /// still identify the other formats.
    pub fn detect(header: &[u8]) -> Option<SourceFormat> {
        if header.len() >= 12
            && &header[0..4] == &[0x00, 0x00, 0x00, 0x0c]
            && &header[4..8] == b"jP  "
            && &header[8..12] == &[13, 10, 135, 10]
        {
            return Some(SourceFormat::Jp2);
        }
        if header.len() >= 2 {
            match &header[0..2] {
                [0xff, 0x4f] => return Some(SourceFormat::J2k),
                [0xff, 0xd8] => return Some(SourceFormat::Jpeg),
                b"II" | b"MM" if header.len() >= 4 => {
                    let version = if &header[0..2] == b"II" {
                        u16::from_le_bytes([header[2], header[3]])
                    } else {
                        u16::from_be_bytes([header[2], header[3]])
                    };
                    if version == 42 || version == 43 {
                        return Some(SourceFormat::Tiff);
                    }
                }
                _ => {}
            }
        }
        None
    }

    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            SourceFormat::Jp2 => &["jp2", "jpx", "jpf"],
            SourceFormat::J2k => &["j2k", "j2c", "jpc"],
            SourceFormat::Tiff => &["tif", "tiff"],
            SourceFormat::Jpeg => &["jpg", "jpeg"],
        }
    }
}
