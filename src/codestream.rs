//! JPEG 2000 codestream marker segments
//!
//! Parses the marker segments of a raw codestream, starting at the SOC
//! marker. Each segment begins with a 2-byte marker code; all but the
//! delimiter-only markers (SOC, SOD, EOC, EPH) follow it with a 2-byte
//! segment length. The SIZ segment is the load-bearing one: it carries the
//! image and tile geometry that the container's image header box must agree
//! with.
//!
//! Reference: ISO/IEC 15444-1, Annex A.

use crate::error::{Error, Result};
use crate::stream::read_exact;
use byteorder::{BigEndian, ReadBytesExt};
use std::fmt;
use std::io::{Read, Seek, SeekFrom};

/// Marker codes from Table A-1
pub mod markers {
    pub const SOC: u16 = 0xFF4F;
    pub const SIZ: u16 = 0xFF51;
    pub const COD: u16 = 0xFF52;
    pub const COC: u16 = 0xFF53;
    pub const TLM: u16 = 0xFF55;
    pub const PLM: u16 = 0xFF57;
    pub const PLT: u16 = 0xFF58;
    pub const QCD: u16 = 0xFF5C;
    pub const QCC: u16 = 0xFF5D;
    pub const RGN: u16 = 0xFF5E;
    pub const POC: u16 = 0xFF5F;
    pub const PPM: u16 = 0xFF60;
    pub const PPT: u16 = 0xFF61;
    pub const CRG: u16 = 0xFF63;
    pub const COM: u16 = 0xFF64;
    pub const SOT: u16 = 0xFF90;
    pub const SOP: u16 = 0xFF91;
    pub const EPH: u16 = 0xFF92;
    pub const SOD: u16 = 0xFF93;
    pub const EOC: u16 = 0xFFD9;
}

/// Image and tile geometry (SIZ)
#[derive(Debug, Clone, PartialEq)]
pub struct SizSegment {
    pub offset: u64,
    pub length: u16,
    /// capability profile
    pub rsiz: u16,
    pub xsiz: u32,
    pub ysiz: u32,
    pub xosiz: u32,
    pub yosiz: u32,
    pub xtsiz: u32,
    pub ytsiz: u32,
    pub xtosiz: u32,
    pub ytosiz: u32,
    /// per-component bit depth
    pub bitdepth: Vec<u8>,
    /// per-component signedness
    pub signed: Vec<bool>,
    /// per-component horizontal subsampling
    pub xrsiz: Vec<u8>,
    /// per-component vertical subsampling
    pub yrsiz: Vec<u8>,
}

impl SizSegment {
    pub fn num_components(&self) -> u16 {
        self.bitdepth.len() as u16
    }

    /// Number of tiles across and down the reference grid
    pub fn tile_grid(&self) -> Option<(u32, u32)> {
        let tw = self.xtsiz.checked_sub(self.xtosiz)?;
        let th = self.ytsiz.checked_sub(self.ytosiz)?;
        if tw == 0 || th == 0 {
            return None;
        }
        let across = (self.xsiz - self.xosiz).div_ceil(tw);
        let down = (self.ysiz - self.yosiz).div_ceil(th);
        Some((across, down))
    }
}

/// Coding style defaults (COD)
#[derive(Debug, Clone, PartialEq)]
pub struct CodSegment {
    pub offset: u64,
    pub length: u16,
    pub scod: u8,
    pub progression_order: u8,
    pub num_layers: u16,
    pub mct: u8,
    pub num_decomposition_levels: u8,
    /// raw code-block width/height exponent offsets
    pub code_block_width: u8,
    pub code_block_height: u8,
    pub code_block_style: u8,
    pub transform: u8,
    /// precinct dimensions per resolution, absent for maximal precincts
    pub precinct_size: Option<Vec<(u32, u32)>>,
}

impl CodSegment {
    pub fn has_sop_markers(&self) -> bool {
        (self.scod & 2) > 0
    }

    pub fn has_eph_markers(&self) -> bool {
        (self.scod & 4) > 0
    }
}

/// Per-component coding style (COC)
#[derive(Debug, Clone, PartialEq)]
pub struct CocSegment {
    pub offset: u64,
    pub length: u16,
    pub component: u16,
    pub scoc: u8,
    pub spcoc: Vec<u8>,
}

/// Quantization defaults (QCD)
#[derive(Debug, Clone, PartialEq)]
pub struct QcdSegment {
    pub offset: u64,
    pub length: u16,
    pub sqcd: u8,
    pub spqcd: Vec<u8>,
}

impl QcdSegment {
    pub fn guard_bits(&self) -> u8 {
        self.sqcd >> 5
    }
}

/// Per-component quantization (QCC)
#[derive(Debug, Clone, PartialEq)]
pub struct QccSegment {
    pub offset: u64,
    pub length: u16,
    pub component: u16,
    pub sqcc: u8,
    pub spqcc: Vec<u8>,
}

/// Region of interest (RGN)
#[derive(Debug, Clone, PartialEq)]
pub struct RgnSegment {
    pub offset: u64,
    pub length: u16,
    pub component: u16,
    pub style: u8,
    pub shift: u8,
}

/// Comment (COM)
#[derive(Debug, Clone, PartialEq)]
pub struct ComSegment {
    pub offset: u64,
    pub length: u16,
    /// 0 = binary, 1 = latin-1 text
    pub registration: u16,
    pub data: Vec<u8>,
}

impl ComSegment {
    pub fn text(&self) -> Option<String> {
        if self.registration == 1 {
            Some(self.data.iter().map(|&b| b as char).collect())
        } else {
            None
        }
    }
}

/// Progression order changes (POC)
///
/// One element per progression change, column-wise.
#[derive(Debug, Clone, PartialEq)]
pub struct PocSegment {
    pub offset: u64,
    pub length: u16,
    pub resolution_start: Vec<u8>,
    pub component_start: Vec<u16>,
    pub layer_end: Vec<u16>,
    pub resolution_end: Vec<u8>,
    pub component_end: Vec<u16>,
    pub progression_order: Vec<u8>,
}

/// Component registration (CRG)
#[derive(Debug, Clone, PartialEq)]
pub struct CrgSegment {
    pub offset: u64,
    pub length: u16,
    pub xcrg: Vec<u16>,
    pub ycrg: Vec<u16>,
}

/// Tile-part lengths (TLM)
#[derive(Debug, Clone, PartialEq)]
pub struct TlmSegment {
    pub offset: u64,
    pub length: u16,
    pub ztlm: u8,
    /// tile indices, absent when tiles appear in order
    pub ttlm: Option<Vec<u16>>,
    pub ptlm: Vec<u32>,
}

/// Packet lengths, tile-part header (PLT)
#[derive(Debug, Clone, PartialEq)]
pub struct PltSegment {
    pub offset: u64,
    pub length: u16,
    pub zplt: u8,
    pub packet_lengths: Vec<u32>,
}

/// Start of tile-part (SOT)
#[derive(Debug, Clone, PartialEq)]
pub struct SotSegment {
    pub offset: u64,
    pub length: u16,
    pub isot: u16,
    /// total tile-part length; 0 means "extends to EOC"
    pub psot: u32,
    pub tpsot: u8,
    pub tnsot: u8,
}

/// One parsed marker segment
#[derive(Debug, Clone, PartialEq)]
pub enum MarkerSegment {
    Soc { offset: u64 },
    Siz(SizSegment),
    Cod(CodSegment),
    Coc(CocSegment),
    Qcd(QcdSegment),
    Qcc(QccSegment),
    Rgn(RgnSegment),
    Com(ComSegment),
    Poc(PocSegment),
    Crg(CrgSegment),
    Tlm(TlmSegment),
    Plt(PltSegment),
    Sot(SotSegment),
    Sod { offset: u64 },
    Eoc { offset: u64 },
    /// valid marker whose segment layout we do not decode
    Reserved {
        marker: u16,
        offset: u64,
        length: u16,
        data: Vec<u8>,
    },
}

impl MarkerSegment {
    pub fn marker_name(&self) -> String {
        match self {
            Self::Soc { .. } => "SOC".into(),
            Self::Siz(_) => "SIZ".into(),
            Self::Cod(_) => "COD".into(),
            Self::Coc(_) => "COC".into(),
            Self::Qcd(_) => "QCD".into(),
            Self::Qcc(_) => "QCC".into(),
            Self::Rgn(_) => "RGN".into(),
            Self::Com(_) => "COM".into(),
            Self::Poc(_) => "POC".into(),
            Self::Crg(_) => "CRG".into(),
            Self::Tlm(_) => "TLM".into(),
            Self::Plt(_) => "PLT".into(),
            Self::Sot(_) => "SOT".into(),
            Self::Sod { .. } => "SOD".into(),
            Self::Eoc { .. } => "EOC".into(),
            Self::Reserved { marker, .. } => format!("0x{marker:04x}"),
        }
    }

    pub fn offset(&self) -> u64 {
        match self {
            Self::Soc { offset }
            | Self::Sod { offset }
            | Self::Eoc { offset }
            | Self::Reserved { offset, .. } => *offset,
            Self::Siz(s) => s.offset,
            Self::Cod(s) => s.offset,
            Self::Coc(s) => s.offset,
            Self::Qcd(s) => s.offset,
            Self::Qcc(s) => s.offset,
            Self::Rgn(s) => s.offset,
            Self::Com(s) => s.offset,
            Self::Poc(s) => s.offset,
            Self::Crg(s) => s.offset,
            Self::Tlm(s) => s.offset,
            Self::Plt(s) => s.offset,
            Self::Sot(s) => s.offset,
        }
    }
}

/// How much of the codestream to walk
#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    /// stop after the main header, before the first tile-part
    pub header_only: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self { header_only: true }
    }
}

/// A parsed codestream: the marker segments in document order
#[derive(Debug, Clone)]
pub struct Codestream {
    /// byte offset of the SOC marker within the stream it was parsed from
    pub offset: u64,
    /// total codestream length in bytes
    pub length: u64,
    pub segments: Vec<MarkerSegment>,
}

impl Codestream {
    /// Parse marker segments starting at the current cursor position
    ///
    /// `length` is the total codestream byte length, needed to resolve
    /// tile-parts whose `psot` is zero. With `header_only` the walk stops at
    /// the first SOT; otherwise it skips each tile-part bit stream via the
    /// SOT lengths and continues through EOC.
    pub fn parse<R: Read + Seek>(
        reader: &mut R,
        length: u64,
        options: &ParseOptions,
    ) -> Result<Self> {
        let offset = reader.stream_position()?;

        let soc = read_marker(reader)?;
        if soc != markers::SOC {
            return Err(Error::InvalidCodestream {
                offset,
                reason: format!("expected the SOC marker, found 0x{soc:04x}"),
            });
        }

        let mut segments = vec![MarkerSegment::Soc { offset }];
        // components come from SIZ; COC/QCC/RGN framing depends on the count
        let mut csiz: u16 = 0;
        let mut last_tile_span: Option<(u64, u64)> = None;

        loop {
            let marker_offset = reader.stream_position()?;
            let marker = read_marker(reader)?;

            if marker < 0xFF00 {
                return Err(Error::InvalidCodestream {
                    offset: marker_offset,
                    reason: format!(
                        "invalid marker 0x{marker:04x}, must be greater than 0xff00"
                    ),
                });
            }

            if marker == markers::SOT && options.header_only {
                // out of the main header, nothing more to do
                break;
            }

            let segment = match marker {
                markers::SIZ => {
                    let siz = parse_siz(reader, marker_offset)?;
                    csiz = siz.num_components();
                    MarkerSegment::Siz(siz)
                }
                markers::COD => MarkerSegment::Cod(parse_cod(reader, marker_offset)?),
                markers::COC => MarkerSegment::Coc(parse_coc(reader, marker_offset, csiz)?),
                markers::QCD => MarkerSegment::Qcd(parse_qcd(reader, marker_offset)?),
                markers::QCC => MarkerSegment::Qcc(parse_qcc(reader, marker_offset, csiz)?),
                markers::RGN => MarkerSegment::Rgn(parse_rgn(reader, marker_offset, csiz)?),
                markers::COM => MarkerSegment::Com(parse_com(reader, marker_offset)?),
                markers::POC => MarkerSegment::Poc(parse_poc(reader, marker_offset, csiz)?),
                markers::CRG => MarkerSegment::Crg(parse_crg(reader, marker_offset)?),
                markers::TLM => MarkerSegment::Tlm(parse_tlm(reader, marker_offset)?),
                markers::PLT => MarkerSegment::Plt(parse_plt(reader, marker_offset)?),
                markers::SOT => {
                    let sot = parse_sot(reader, marker_offset)?;
                    let tile_length = if sot.psot == 0 {
                        offset + length - sot.offset
                    } else {
                        sot.psot as u64
                    };
                    last_tile_span = Some((sot.offset, tile_length));
                    MarkerSegment::Sot(sot)
                }
                markers::SOD => MarkerSegment::Sod {
                    offset: marker_offset,
                },
                markers::EOC => MarkerSegment::Eoc {
                    offset: marker_offset,
                },
                // 0xFF30-0xFF3F are marker-only: no length field follows
                0xFF30..=0xFF3F => MarkerSegment::Reserved {
                    marker,
                    offset: marker_offset,
                    length: 0,
                    data: Vec::new(),
                },
                _ => parse_reserved(reader, marker, marker_offset)?,
            };

            let is_sod = matches!(segment, MarkerSegment::Sod { .. });
            let is_eoc = matches!(segment, MarkerSegment::Eoc { .. });
            segments.push(segment);

            if is_eoc {
                break;
            }

            if is_sod {
                // seek past the tile-part bit stream
                let (tile_offset, tile_length) =
                    last_tile_span.ok_or(Error::InvalidCodestream {
                        offset: marker_offset,
                        reason: "SOD marker without a preceding SOT".into(),
                    })?;
                reader.seek(SeekFrom::Start(tile_offset + tile_length))?;
            }
        }

        Ok(Self {
            offset,
            length,
            segments,
        })
    }

    /// The SIZ segment, present in any complete main header
    pub fn siz(&self) -> Option<&SizSegment> {
        self.segments.iter().find_map(|s| match s {
            MarkerSegment::Siz(siz) => Some(siz),
            _ => None,
        })
    }

    /// The COD segment from the main header
    pub fn cod(&self) -> Option<&CodSegment> {
        self.segments.iter().find_map(|s| match s {
            MarkerSegment::Cod(cod) => Some(cod),
            _ => None,
        })
    }
}

impl fmt::Display for Codestream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Codestream @ ({}, {})", self.offset, self.length)?;
        for segment in &self.segments {
            writeln!(f, "    {} @ {}", segment.marker_name(), segment.offset())?;
        }
        Ok(())
    }
}

fn read_marker<R: Read + Seek>(reader: &mut R) -> Result<u16> {
    let offset = reader.stream_position()?;
    reader.read_u16::<BigEndian>().map_err(|_| Error::InvalidCodestream {
        offset,
        reason: "unable to read an expected marker".into(),
    })
}

/// Read a segment length field and the payload it frames
fn read_segment_body<R: Read + Seek>(reader: &mut R, offset: u64) -> Result<(u16, Vec<u8>)> {
    let length = reader.read_u16::<BigEndian>().map_err(|_| Error::InvalidCodestream {
        offset,
        reason: "truncated segment length".into(),
    })?;
    if length < 2 {
        return Err(Error::InvalidCodestream {
            offset,
            reason: format!("segment length {length} is too small"),
        });
    }
    let body = read_exact(reader, length as usize - 2).map_err(|_| Error::InvalidCodestream {
        offset,
        reason: format!("truncated segment, claimed {length} bytes"),
    })?;
    Ok((length, body))
}

fn parse_siz<R: Read + Seek>(reader: &mut R, offset: u64) -> Result<SizSegment> {
    let (length, body) = read_segment_body(reader, offset)?;
    if body.len() < 36 {
        return Err(Error::InvalidCodestream {
            offset,
            reason: format!("SIZ segment is {} bytes, too short", body.len()),
        });
    }

    let mut c = std::io::Cursor::new(&body);
    let rsiz = c.read_u16::<BigEndian>()?;
    let xsiz = c.read_u32::<BigEndian>()?;
    let ysiz = c.read_u32::<BigEndian>()?;
    let xosiz = c.read_u32::<BigEndian>()?;
    let yosiz = c.read_u32::<BigEndian>()?;
    let xtsiz = c.read_u32::<BigEndian>()?;
    let ytsiz = c.read_u32::<BigEndian>()?;
    let xtosiz = c.read_u32::<BigEndian>()?;
    let ytosiz = c.read_u32::<BigEndian>()?;
    let csiz = c.read_u16::<BigEndian>()?;

    if body.len() < 36 + 3 * csiz as usize {
        return Err(Error::InvalidCodestream {
            offset,
            reason: format!("SIZ segment truncated, claims {csiz} components"),
        });
    }

    let mut bitdepth = Vec::with_capacity(csiz as usize);
    let mut signed = Vec::with_capacity(csiz as usize);
    let mut xrsiz = Vec::with_capacity(csiz as usize);
    let mut yrsiz = Vec::with_capacity(csiz as usize);
    for j in 0..csiz as usize {
        let ssiz = body[36 + j * 3];
        bitdepth.push((ssiz & 0x7f) + 1);
        signed.push((ssiz & 0x80) > 0);
        let dx = body[36 + j * 3 + 1];
        let dy = body[36 + j * 3 + 2];
        if dx == 0 || dy == 0 {
            log::warn!("invalid subsampling for component {j}: dx={dx}, dy={dy}");
        }
        xrsiz.push(dx);
        yrsiz.push(dy);
    }

    let siz = SizSegment {
        offset,
        length,
        rsiz,
        xsiz,
        ysiz,
        xosiz,
        yosiz,
        xtsiz,
        ytsiz,
        xtosiz,
        ytosiz,
        bitdepth,
        signed,
        xrsiz,
        yrsiz,
    };

    match siz.tile_grid() {
        Some((across, down)) => {
            if across as u64 * down as u64 > 65535 {
                log::warn!("invalid number of tiles ({})", across as u64 * down as u64);
            }
        }
        None => log::warn!(
            "invalid tile specification: size {}x{}, offset {}x{}",
            siz.xtsiz,
            siz.ytsiz,
            siz.xtosiz,
            siz.ytosiz
        ),
    }

    Ok(siz)
}

fn parse_cod<R: Read + Seek>(reader: &mut R, offset: u64) -> Result<CodSegment> {
    let (length, body) = read_segment_body(reader, offset)?;
    if body.len() < 10 {
        return Err(Error::InvalidCodestream {
            offset,
            reason: format!("COD segment is {} bytes, too short", body.len()),
        });
    }

    let mut c = std::io::Cursor::new(&body);
    let scod = c.read_u8()?;
    let progression_order = c.read_u8()?;
    let num_layers = c.read_u16::<BigEndian>()?;
    let mct = c.read_u8()?;
    let num_decomposition_levels = c.read_u8()?;
    let code_block_width = c.read_u8()?;
    let code_block_height = c.read_u8()?;
    let code_block_style = c.read_u8()?;
    let transform = c.read_u8()?;

    let precinct_size = if body.len() > 10 {
        Some(parse_precinct_size(&body[10..]))
    } else {
        None
    };

    Ok(CodSegment {
        offset,
        length,
        scod,
        progression_order,
        num_layers,
        mct,
        num_decomposition_levels,
        code_block_width,
        code_block_height,
        code_block_style,
        transform,
        precinct_size,
    })
}

fn parse_precinct_size(spcod: &[u8]) -> Vec<(u32, u32)> {
    spcod
        .iter()
        .map(|&b| (1u32 << (b & 0x0f), 1u32 << (b >> 4)))
        .collect()
}

fn read_component_index<R: Read>(reader: &mut R, csiz: u16) -> Result<u16> {
    // one byte unless the image has more than 256 components
    if csiz < 257 {
        Ok(reader.read_u8()? as u16)
    } else {
        Ok(reader.read_u16::<BigEndian>()?)
    }
}

fn parse_coc<R: Read + Seek>(reader: &mut R, offset: u64, csiz: u16) -> Result<CocSegment> {
    let (length, body) = read_segment_body(reader, offset)?;
    let mut c = std::io::Cursor::new(&body);
    let component = read_component_index(&mut c, csiz)?;
    let scoc = c.read_u8()?;
    let spcoc = body[c.position() as usize..].to_vec();
    Ok(CocSegment {
        offset,
        length,
        component,
        scoc,
        spcoc,
    })
}

fn parse_qcd<R: Read + Seek>(reader: &mut R, offset: u64) -> Result<QcdSegment> {
    let (length, body) = read_segment_body(reader, offset)?;
    if body.is_empty() {
        return Err(Error::InvalidCodestream {
            offset,
            reason: "empty QCD segment".into(),
        });
    }
    Ok(QcdSegment {
        offset,
        length,
        sqcd: body[0],
        spqcd: body[1..].to_vec(),
    })
}

fn parse_qcc<R: Read + Seek>(reader: &mut R, offset: u64, csiz: u16) -> Result<QccSegment> {
    let (length, body) = read_segment_body(reader, offset)?;
    let mut c = std::io::Cursor::new(&body);
    let component = read_component_index(&mut c, csiz)?;
    let sqcc = c.read_u8()?;
    let spqcc = body[c.position() as usize..].to_vec();
    Ok(QccSegment {
        offset,
        length,
        component,
        sqcc,
        spqcc,
    })
}

fn parse_rgn<R: Read + Seek>(reader: &mut R, offset: u64, csiz: u16) -> Result<RgnSegment> {
    let (length, body) = read_segment_body(reader, offset)?;
    let mut c = std::io::Cursor::new(&body);
    let component = read_component_index(&mut c, csiz)?;
    let style = c.read_u8()?;
    let shift = c.read_u8()?;
    Ok(RgnSegment {
        offset,
        length,
        component,
        style,
        shift,
    })
}

fn parse_com<R: Read + Seek>(reader: &mut R, offset: u64) -> Result<ComSegment> {
    let (length, body) = read_segment_body(reader, offset)?;
    if body.len() < 2 {
        return Err(Error::InvalidCodestream {
            offset,
            reason: "COM segment too short".into(),
        });
    }
    let registration = u16::from_be_bytes([body[0], body[1]]);
    Ok(ComSegment {
        offset,
        length,
        registration,
        data: body[2..].to_vec(),
    })
}

fn parse_poc<R: Read + Seek>(reader: &mut R, offset: u64, csiz: u16) -> Result<PocSegment> {
    let (length, body) = read_segment_body(reader, offset)?;

    // component fields widen with the component count
    let entry_len = if csiz < 257 { 7 } else { 9 };
    let n = body.len() / entry_len;

    let mut c = std::io::Cursor::new(&body);
    let mut resolution_start = Vec::with_capacity(n);
    let mut component_start = Vec::with_capacity(n);
    let mut layer_end = Vec::with_capacity(n);
    let mut resolution_end = Vec::with_capacity(n);
    let mut component_end = Vec::with_capacity(n);
    let mut progression_order = Vec::with_capacity(n);
    for _ in 0..n {
        resolution_start.push(c.read_u8()?);
        component_start.push(read_component_index(&mut c, csiz)?);
        layer_end.push(c.read_u16::<BigEndian>()?);
        resolution_end.push(c.read_u8()?);
        component_end.push(read_component_index(&mut c, csiz)?);
        progression_order.push(c.read_u8()?);
    }

    Ok(PocSegment {
        offset,
        length,
        resolution_start,
        component_start,
        layer_end,
        resolution_end,
        component_end,
        progression_order,
    })
}

fn parse_crg<R: Read + Seek>(reader: &mut R, offset: u64) -> Result<CrgSegment> {
    let (length, body) = read_segment_body(reader, offset)?;
    let n = body.len() / 4;
    let mut c = std::io::Cursor::new(&body);
    let mut xcrg = Vec::with_capacity(n);
    let mut ycrg = Vec::with_capacity(n);
    for _ in 0..n {
        xcrg.push(c.read_u16::<BigEndian>()?);
        ycrg.push(c.read_u16::<BigEndian>()?);
    }
    Ok(CrgSegment {
        offset,
        length,
        xcrg,
        ycrg,
    })
}

fn parse_tlm<R: Read + Seek>(reader: &mut R, offset: u64) -> Result<TlmSegment> {
    let (length, body) = read_segment_body(reader, offset)?;
    if body.len() < 2 {
        return Err(Error::InvalidCodestream {
            offset,
            reason: "TLM segment too short".into(),
        });
    }
    let ztlm = body[0];
    let stlm = body[1];
    let st = (stlm >> 4) & 0x3;
    let sp = (stlm >> 6) & 0x1;

    let entry_len = st as usize + (sp as usize + 1) * 2;
    let ntiles = (body.len() - 2) / entry_len;

    let mut c = std::io::Cursor::new(&body[2..]);
    let mut ttlm = if st == 0 { None } else { Some(Vec::with_capacity(ntiles)) };
    let mut ptlm = Vec::with_capacity(ntiles);
    for _ in 0..ntiles {
        if let Some(t) = ttlm.as_mut() {
            let index = match st {
                1 => c.read_u8()? as u16,
                _ => c.read_u16::<BigEndian>()?,
            };
            t.push(index);
        }
        let part_length = if sp == 0 {
            c.read_u16::<BigEndian>()? as u32
        } else {
            c.read_u32::<BigEndian>()?
        };
        ptlm.push(part_length);
    }

    Ok(TlmSegment {
        offset,
        length,
        ztlm,
        ttlm,
        ptlm,
    })
}

fn parse_plt<R: Read + Seek>(reader: &mut R, offset: u64) -> Result<PltSegment> {
    let (length, body) = read_segment_body(reader, offset)?;
    if body.is_empty() {
        return Err(Error::InvalidCodestream {
            offset,
            reason: "empty PLT segment".into(),
        });
    }
    let zplt = body[0];

    // packet lengths are 7-bit groups, high bit set on continuation bytes
    let mut packet_lengths = Vec::new();
    let mut value: u32 = 0;
    for &byte in &body[1..] {
        value = (value << 7) | (byte & 0x7f) as u32;
        if byte & 0x80 == 0 {
            packet_lengths.push(value);
            value = 0;
        }
    }

    Ok(PltSegment {
        offset,
        length,
        zplt,
        packet_lengths,
    })
}

fn parse_sot<R: Read + Seek>(reader: &mut R, offset: u64) -> Result<SotSegment> {
    let length = reader.read_u16::<BigEndian>().map_err(|_| Error::InvalidCodestream {
        offset,
        reason: "truncated SOT segment".into(),
    })?;
    let isot = reader.read_u16::<BigEndian>()?;
    let psot = reader.read_u32::<BigEndian>()?;
    let tpsot = reader.read_u8()?;
    let tnsot = reader.read_u8()?;
    Ok(SotSegment {
        offset,
        length,
        isot,
        psot,
        tpsot,
        tnsot,
    })
}

fn parse_reserved<R: Read + Seek>(
    reader: &mut R,
    marker: u16,
    offset: u64,
) -> Result<MarkerSegment> {
    let (length, data) = read_segment_body(reader, offset)?;
    Ok(MarkerSegment::Reserved {
        marker,
        offset,
        length,
        data,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Cursor;

    /// a single-tile greyscale main header plus one empty tile-part
    pub(crate) fn synthetic_codestream(
        xsiz: u32,
        ysiz: u32,
        num_components: u8,
    ) -> Vec<u8> {
        let mut b = Vec::new();
        b.write_u16::<BigEndian>(markers::SOC).unwrap();

        // SIZ
        b.write_u16::<BigEndian>(markers::SIZ).unwrap();
        b.write_u16::<BigEndian>(38 + 3 * num_components as u16)
            .unwrap();
        b.write_u16::<BigEndian>(0).unwrap(); // rsiz
        b.write_u32::<BigEndian>(xsiz).unwrap();
        b.write_u32::<BigEndian>(ysiz).unwrap();
        b.write_u32::<BigEndian>(0).unwrap(); // xosiz
        b.write_u32::<BigEndian>(0).unwrap(); // yosiz
        b.write_u32::<BigEndian>(xsiz).unwrap(); // xtsiz
        b.write_u32::<BigEndian>(ysiz).unwrap(); // ytsiz
        b.write_u32::<BigEndian>(0).unwrap(); // xtosiz
        b.write_u32::<BigEndian>(0).unwrap(); // ytosiz
        b.write_u16::<BigEndian>(num_components as u16).unwrap();
        for _ in 0..num_components {
            b.write_u8(7).unwrap(); // 8-bit unsigned
            b.write_u8(1).unwrap();
            b.write_u8(1).unwrap();
        }

        // COD
        b.write_u16::<BigEndian>(markers::COD).unwrap();
        b.write_u16::<BigEndian>(12).unwrap();
        b.write_u8(0).unwrap(); // scod
        b.write_u8(0).unwrap(); // LRCP
        b.write_u16::<BigEndian>(1).unwrap(); // one layer
        b.write_u8(0).unwrap(); // no MCT
        b.write_u8(5).unwrap(); // decomposition levels
        b.write_u8(4).unwrap(); // 64x64 code blocks
        b.write_u8(4).unwrap();
        b.write_u8(0).unwrap();
        b.write_u8(0).unwrap(); // 9x7 irreversible

        // QCD, scalar derived, one step size
        b.write_u16::<BigEndian>(markers::QCD).unwrap();
        b.write_u16::<BigEndian>(5).unwrap();
        b.write_u8(0x42).unwrap();
        b.write_u16::<BigEndian>(0x1234).unwrap();

        // one empty tile-part: SOT + SOD + EOC
        let sot_offset = b.len();
        b.write_u16::<BigEndian>(markers::SOT).unwrap();
        b.write_u16::<BigEndian>(10).unwrap();
        b.write_u16::<BigEndian>(0).unwrap(); // isot
        b.write_u32::<BigEndian>(14).unwrap(); // psot: SOT + SOD only
        b.write_u8(0).unwrap();
        b.write_u8(1).unwrap();
        b.write_u16::<BigEndian>(markers::SOD).unwrap();
        assert_eq!(b.len(), sot_offset + 14);
        b.write_u16::<BigEndian>(markers::EOC).unwrap();
        b
    }

    #[test]
    fn test_header_only_stops_before_tiles() {
        let data = synthetic_codestream(200, 100, 3);
        let mut cursor = Cursor::new(data.clone());
        let cs = Codestream::parse(
            &mut cursor,
            data.len() as u64,
            &ParseOptions { header_only: true },
        )
        .unwrap();

        let names: Vec<String> = cs.segments.iter().map(|s| s.marker_name()).collect();
        assert_eq!(names, ["SOC", "SIZ", "COD", "QCD"]);
    }

    #[test]
    fn test_siz_fields() {
        let data = synthetic_codestream(200, 100, 3);
        let mut cursor = Cursor::new(data.clone());
        let cs =
            Codestream::parse(&mut cursor, data.len() as u64, &ParseOptions::default()).unwrap();

        let siz = cs.siz().unwrap();
        assert_eq!((siz.xsiz, siz.ysiz), (200, 100));
        assert_eq!(siz.num_components(), 3);
        assert_eq!(siz.bitdepth, vec![8, 8, 8]);
        assert_eq!(siz.signed, vec![false, false, false]);
        assert_eq!(siz.tile_grid(), Some((1, 1)));
    }

    #[test]
    fn test_full_parse_reaches_eoc() {
        let data = synthetic_codestream(64, 64, 1);
        let mut cursor = Cursor::new(data.clone());
        let cs = Codestream::parse(
            &mut cursor,
            data.len() as u64,
            &ParseOptions { header_only: false },
        )
        .unwrap();

        let names: Vec<String> = cs.segments.iter().map(|s| s.marker_name()).collect();
        assert_eq!(names, ["SOC", "SIZ", "COD", "QCD", "SOT", "SOD", "EOC"]);
    }

    #[test]
    fn test_missing_soc_is_fatal() {
        let mut cursor = Cursor::new(vec![0xff, 0x51, 0x00, 0x02]);
        let err =
            Codestream::parse(&mut cursor, 4, &ParseOptions::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidCodestream { .. }));
    }

    #[test]
    fn test_truncated_segment_is_fatal() {
        let mut data = synthetic_codestream(64, 64, 1);
        data.truncate(20); // cut inside the SIZ segment
        let mut cursor = Cursor::new(data);
        let err = Codestream::parse(&mut cursor, 20, &ParseOptions::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidCodestream { .. }));
    }

    #[test]
    fn test_low_marker_is_fatal() {
        let mut data = Vec::new();
        data.write_u16::<BigEndian>(markers::SOC).unwrap();
        data.write_u16::<BigEndian>(0x1234).unwrap();
        let mut cursor = Cursor::new(data);
        let err = Codestream::parse(&mut cursor, 4, &ParseOptions::default()).unwrap_err();
        match err {
            Error::InvalidCodestream { offset, .. } => assert_eq!(offset, 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_plt_continuation_bytes() {
        // 0x81 0x02 encodes 130; 0x05 encodes 5
        let mut body = vec![0u8];
        body.extend_from_slice(&[0x81, 0x02, 0x05]);
        let mut data = Vec::new();
        data.write_u16::<BigEndian>(markers::PLT).unwrap();
        data.write_u16::<BigEndian>(2 + body.len() as u16).unwrap();
        data.extend_from_slice(&body);

        let mut cursor = Cursor::new(data);
        cursor.set_position(2);
        let plt = parse_plt(&mut cursor, 0).unwrap();
        assert_eq!(plt.packet_lengths, vec![130, 5]);
    }
}
