//! Structural I/O for JPEG 2000 containers.
//!
//! This crate gives structural access to JP2/JPX files and their embedded
//! codestreams: the recursive box tree, the box-sequence legality rules, the
//! codestream marker segments, and the TIFF IFD plumbing used to transplant
//! EXIF/GeoTIFF, XMP, and ICC metadata from other formats into a JP2
//! container. The wavelet codec itself is out of scope: an external encoder
//! or decoder owns the pixels, this crate owns the container.
//!
//! # Design Principles
//!
//! - **Streaming**: codestreams are wrapped by byte range, never buffered
//! - **Explicit configuration**: options are values passed into calls, not
//!   ambient state
//! - **Lenient reads, strict writes**: mildly non-conformant files parse
//!   with warnings; writing a non-conformant file is an error
//!
//! # Reading
//!
//! ```no_run
//! use jp2_io::Jp2File;
//!
//! # fn main() -> jp2_io::Result<()> {
//! let jp2 = Jp2File::open("image.jp2")?;
//! println!("shape: {:?}", jp2.shape()?);
//! for warning in jp2.warnings() {
//!     println!("warning: {warning}");
//! }
//!
//! let codestream = jp2.codestream()?;
//! if let Some(siz) = codestream.siz() {
//!     println!("tiles: {:?}", siz.tile_grid());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Converting
//!
//! Wrap an externally produced codestream and carry the source metadata
//! over:
//!
//! ```no_run
//! use jp2_io::{ConvertOptions, Converter};
//!
//! # fn main() -> jp2_io::Result<()> {
//! let options = ConvertOptions::new().icc_profile(true);
//! let jp2 = Converter::new(options).convert(
//!     "encoded.j2k",
//!     Some("source.tif"),
//!     "output.jp2",
//! )?;
//! println!("{} UUID boxes appended", jp2.uuid_boxes().len());
//! # Ok(())
//! # }
//! ```

pub mod boxes;
pub mod codestream;
pub mod convert;
mod error;
pub mod format;
pub mod icc;
mod jp2;
mod stream;
pub mod tiff;
pub mod validate;
#[cfg(feature = "xmp")]
pub mod xmp;

pub use boxes::{FourCC, Jp2Box};
pub use codestream::{Codestream, ParseOptions};
pub use convert::{
    append_exif_uuid, append_xmp_uuid, capture_jpeg_metadata, capture_tiff_metadata,
    rewrap_with_icc_profile, CapturedMetadata, ConvertOptions, Converter,
};
pub use error::{Error, Result, StructuralWarning};
pub use format::SourceFormat;
pub use jp2::{box_long_name, interpret_uuid_ifd, Jp2File};
pub use stream::Endian;
pub use tiff::{Ifd, IfdEntry, IfdPayload, IfdValue};
