//! Error types for jp2-io

use std::io;

/// Result type for jp2-io operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reading or writing JPEG 2000 containers
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A binary read could not obtain the requested byte count
    #[error("truncated input at offset {offset}: wanted {wanted} bytes, got {got}")]
    Truncated {
        offset: u64,
        wanted: usize,
        got: usize,
    },

    /// The box sequence violates a mandatory structural rule
    #[error("invalid structure: {0}")]
    InvalidStructure(String),

    /// Truncated or unrecognized marker segment in a codestream
    #[error("invalid codestream at offset {offset}: {reason}")]
    InvalidCodestream { offset: u64, reason: String },

    /// Malformed TIFF IFD data
    #[error("invalid TIFF: {0}")]
    InvalidTiff(String),

    /// Unsupported file format
    #[error("unsupported format")]
    UnsupportedFormat,
}

/// Non-fatal structural findings
///
/// These flag files that are usable but not strictly conformant. They are
/// returned alongside successful parses and logged at `warn` level; they
/// never abort an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum StructuralWarning {
    /// IHDR and SIZ disagree on image geometry
    DimensionMismatch {
        ihdr: (u32, u32, u16),
        siz: (u32, u32, u16),
    },

    /// Colour specification method not allowed under the plain "jp2 " brand
    NonConformantColourMethod { offset: u64, method: u8 },

    /// Colour specification approximation field should be 0 under "jp2 "
    InvalidApproximation { offset: u64, approximation: u8 },

    /// Enumerated colourspace value is not one we recognize
    UnknownColourspace { offset: u64, colorspace: u32 },

    /// More than one JP2 header box at the top level
    MultipleHeaderBoxes { count: usize },

    /// More than one codestream box; all but the first are ignored
    MultipleCodestreamBoxes { count: usize },

    /// Box id not recognized by this reader
    UnrecognizedBox {
        id: crate::boxes::FourCC,
        offset: u64,
    },

    /// Fewer than 8 bytes left over at the end of a container
    TrailingBytes { count: usize },

    /// A box claims a length that exceeds its container
    BoxOverrunsFile {
        id: crate::boxes::FourCC,
        length: u64,
        available: u64,
    },
}

impl std::fmt::Display for StructuralWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DimensionMismatch { ihdr, siz } => write!(
                f,
                "image header box dimensions {ihdr:?} do not match the \
                 codestream SIZ dimensions {siz:?}"
            ),
            Self::NonConformantColourMethod { offset, method } => write!(
                f,
                "colour specification box at offset {offset} uses method \
                 {method}; the 'jp2 ' brand requires an enumerated colourspace \
                 or a restricted ICC profile"
            ),
            Self::InvalidApproximation {
                offset,
                approximation,
            } => write!(
                f,
                "colour specification box at offset {offset} has approximation \
                 {approximation}; it should be 0 under the 'jp2 ' brand"
            ),
            Self::UnknownColourspace { offset, colorspace } => write!(
                f,
                "unrecognized enumerated colourspace {colorspace} in colour \
                 specification box at offset {offset}"
            ),
            Self::MultipleHeaderBoxes { count } => write!(
                f,
                "{count} JP2 header boxes found at the top level; there should \
                 be exactly one"
            ),
            Self::MultipleCodestreamBoxes { count } => write!(
                f,
                "{count} codestream boxes found; all but the first are ignored"
            ),
            Self::UnrecognizedBox { id, offset } => {
                write!(f, "unrecognized box '{id}' at offset {offset}")
            }
            Self::TrailingBytes { count } => {
                write!(f, "{count} extra bytes at end of container ignored")
            }
            Self::BoxOverrunsFile {
                id,
                length,
                available,
            } => write!(
                f,
                "the '{id}' box claims {length} bytes but only {available} \
                 remain in its container"
            ),
        }
    }
}
