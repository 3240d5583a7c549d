//! ICC profile header decoding
//!
//! Only the fixed 128-byte header is interpreted; the profile body stays
//! opaque. This is enough to sanity-check a captured profile before it is
//! committed to a colour specification box, and to describe it.
//!
//! Reference: ICC.1 profile format specification, section 7.2.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ReadBytesExt};
use std::io::Cursor;

/// The interpreted fields of an ICC profile header
#[derive(Debug, Clone, PartialEq)]
pub struct IccProfileHeader {
    pub size: u32,
    pub preferred_cmm_type: u32,
    pub version: (u8, u8),
    pub device_class: [u8; 4],
    pub colour_space: [u8; 4],
    pub connection_space: [u8; 4],
    pub datetime: IccDateTime,
    pub platform: [u8; 4],
    pub flags: u32,
    pub rendering_intent: u32,
}

/// Profile creation timestamp
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IccDateTime {
    pub year: u16,
    pub month: u16,
    pub day: u16,
    pub hour: u16,
    pub minute: u16,
    pub second: u16,
}

impl IccProfileHeader {
    /// Parse the 128-byte header from the start of a profile
    pub fn parse(profile: &[u8]) -> Result<Self> {
        if profile.len() < 128 {
            return Err(Error::InvalidStructure(format!(
                "an ICC profile must be at least 128 bytes, got {}",
                profile.len()
            )));
        }

        let mut c = Cursor::new(profile);
        let size = c.read_u32::<BigEndian>()?;
        let preferred_cmm_type = c.read_u32::<BigEndian>()?;

        let major = c.read_u8()?;
        let minor_bcd = c.read_u8()?;
        c.set_position(c.position() + 2); // reserved version bytes
        let version = (major, minor_bcd >> 4);

        let mut device_class = [0u8; 4];
        std::io::Read::read_exact(&mut c, &mut device_class)?;
        let mut colour_space = [0u8; 4];
        std::io::Read::read_exact(&mut c, &mut colour_space)?;
        let mut connection_space = [0u8; 4];
        std::io::Read::read_exact(&mut c, &mut connection_space)?;

        let datetime = IccDateTime {
            year: c.read_u16::<BigEndian>()?,
            month: c.read_u16::<BigEndian>()?,
            day: c.read_u16::<BigEndian>()?,
            hour: c.read_u16::<BigEndian>()?,
            minute: c.read_u16::<BigEndian>()?,
            second: c.read_u16::<BigEndian>()?,
        };

        let mut signature = [0u8; 4];
        std::io::Read::read_exact(&mut c, &mut signature)?;
        if &signature != b"acsp" {
            return Err(Error::InvalidStructure(
                "the ICC profile file signature is not 'acsp'".into(),
            ));
        }

        let mut platform = [0u8; 4];
        std::io::Read::read_exact(&mut c, &mut platform)?;
        let flags = c.read_u32::<BigEndian>()?;

        // device manufacturer, model, attributes are not interpreted
        c.set_position(64);
        let rendering_intent = c.read_u32::<BigEndian>()?;

        Ok(Self {
            size,
            preferred_cmm_type,
            version,
            device_class,
            colour_space,
            connection_space,
            datetime,
            platform,
            flags,
            rendering_intent,
        })
    }

    pub fn device_class_name(&self) -> Option<&'static str> {
        match &self.device_class {
            b"scnr" => Some("input device profile"),
            b"mntr" => Some("display device profile"),
            b"prtr" => Some("output device profile"),
            b"link" => Some("devicelink profile"),
            b"spac" => Some("colorspace conversion profile"),
            b"abst" => Some("abstract profile"),
            b"nmcl" => Some("named colour profile"),
            _ => None,
        }
    }

    pub fn rendering_intent_name(&self) -> Option<&'static str> {
        match self.rendering_intent {
            0 => Some("perceptual"),
            1 => Some("media-relative colorimetric"),
            2 => Some("saturation"),
            3 => Some("ICC-absolute colorimetric"),
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    pub(crate) fn synthetic_profile() -> Vec<u8> {
        let mut b = Vec::new();
        b.write_u32::<BigEndian>(128).unwrap();
        b.extend_from_slice(b"lcms");
        b.extend_from_slice(&[4, 0x30, 0, 0]); // version 4.3
        b.extend_from_slice(b"mntr");
        b.extend_from_slice(b"RGB ");
        b.extend_from_slice(b"XYZ ");
        for v in [2021u16, 5, 2, 10, 0, 0] {
            b.write_u16::<BigEndian>(v).unwrap();
        }
        b.extend_from_slice(b"acsp");
        b.extend_from_slice(b"APPL");
        b.write_u32::<BigEndian>(0).unwrap();
        b.resize(64, 0);
        b.write_u32::<BigEndian>(1).unwrap(); // media-relative
        b.resize(128, 0);
        b
    }

    #[test]
    fn test_parse_header() {
        let header = IccProfileHeader::parse(&synthetic_profile()).unwrap();
        assert_eq!(header.size, 128);
        assert_eq!(header.version, (4, 3));
        assert_eq!(header.device_class_name(), Some("display device profile"));
        assert_eq!(&header.colour_space, b"RGB ");
        assert_eq!(header.datetime.year, 2021);
        assert_eq!(
            header.rendering_intent_name(),
            Some("media-relative colorimetric")
        );
    }

    #[test]
    fn test_short_profile_is_rejected() {
        assert!(IccProfileHeader::parse(&[0u8; 64]).is_err());
    }

    #[test]
    fn test_bad_signature_is_rejected() {
        let mut profile = synthetic_profile();
        profile[36..40].copy_from_slice(b"nope");
        assert!(IccProfileHeader::parse(&profile).is_err());
    }
}
