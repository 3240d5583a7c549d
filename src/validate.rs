//! Box sequence legality rules
//!
//! A pipeline of independent checks over a top-level box list. Mandatory
//! rules fail with [`Error::InvalidStructure`], naming the rule and the box;
//! lesser findings accumulate as [`StructuralWarning`]s. The checks run in a
//! fixed order and the first fatal violation aborts.
//!
//! When building a file for writing, the same pipeline runs in strict mode:
//! findings that are tolerated in files we merely read would create bad
//! files if written, so they become fatal.

use crate::boxes::{
    brands, ids, BoxData, FourCC, Jp2Box, ENUMERATED_COLORSPACE, GREYSCALE,
    RESTRICTED_ICC_PROFILE, SIGNATURE_PAYLOAD, SRGB, YCC,
};
use crate::codestream::SizSegment;
use crate::error::{Error, Result, StructuralWarning};

/// Whether tolerable findings stay warnings or become fatal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// lenient: tolerate mildly non-conformant real-world files
    Reading,
    /// strict: refuse to create bad files
    Writing,
}

/// Validate a top-level box list
///
/// Returns the non-fatal findings; fails on the first mandatory-rule
/// violation.
pub fn validate(boxes: &[Jp2Box], mode: Mode) -> Result<Vec<StructuralWarning>> {
    let mut warnings = Vec::new();

    check_signature_and_file_type(boxes)?;

    let brand = match &boxes[1].data {
        BoxData::FileType(ftyp) => ftyp.brand,
        _ => unreachable!("checked above"),
    };
    let jpx = brand == brands::JPX;

    check_header_box(boxes, &mut warnings)?;
    check_header_child_placement(boxes, None)?;
    check_colour_specification(boxes, mode, jpx, &mut warnings)?;
    check_codestream_placement(boxes, &mut warnings)?;

    if jpx {
        check_jpx_rules(boxes)?;
    } else {
        check_no_unrecognized_boxes(boxes)?;
    }

    for warning in &warnings {
        log::warn!("{warning}");
    }

    Ok(warnings)
}

/// Rule 1: signature first, file type second, "jp2 " in the compatibility list
fn check_signature_and_file_type(boxes: &[Jp2Box]) -> Result<()> {
    let Some(first) = boxes.first() else {
        return Err(Error::InvalidStructure("the file contains no boxes".into()));
    };

    match &first.data {
        BoxData::Signature(sig) if sig.signature == SIGNATURE_PAYLOAD => {}
        BoxData::Signature(sig) => {
            return Err(Error::InvalidStructure(format!(
                "the signature box payload {:?} is invalid",
                sig.signature
            )))
        }
        _ => {
            return Err(Error::InvalidStructure(
                "the first box must be the signature box".into(),
            ))
        }
    }

    let Some(second) = boxes.get(1) else {
        return Err(Error::InvalidStructure(
            "the file ends after the signature box".into(),
        ));
    };

    match &second.data {
        BoxData::FileType(ftyp) => {
            if !ftyp.is_compatible_with(brands::JP2) {
                return Err(Error::InvalidStructure(format!(
                    "the file type box compatibility list {:?} does not \
                     include 'jp2 '",
                    ftyp.compatibility_list
                )));
            }
        }
        _ => {
            return Err(Error::InvalidStructure(
                "the second box must be the file type box".into(),
            ))
        }
    }

    Ok(())
}

/// Rule 2, part 1: one JP2 header box whose first child is the image header
fn check_header_box(boxes: &[Jp2Box], warnings: &mut Vec<StructuralWarning>) -> Result<()> {
    let headers: Vec<&Jp2Box> = boxes
        .iter()
        .filter(|b| b.box_id() == ids::JP2_HEADER)
        .collect();

    let Some(jp2h) = headers.first() else {
        return Err(Error::InvalidStructure(
            "no JP2 header box was located in the outermost jacket of boxes".into(),
        ));
    };

    if headers.len() > 1 {
        warnings.push(StructuralWarning::MultipleHeaderBoxes {
            count: headers.len(),
        });
    }

    let children = jp2h.children().unwrap_or(&[]);
    match children.first() {
        Some(child) if child.box_id() == ids::IMAGE_HEADER => {}
        _ => {
            return Err(Error::InvalidStructure(
                "the first box in the JP2 header box must be the image header box".into(),
            ))
        }
    }

    Ok(())
}

/// Rule 2, part 2: header-content boxes may only sit directly under a header
///
/// Checked recursively over the whole tree. `parent` is the id of the
/// containing box, `None` at the top level. Codestream header and
/// compositing layer header boxes count as header boxes too, since that is
/// where these children live in multi-codestream files.
fn check_header_child_placement(boxes: &[Jp2Box], parent: Option<FourCC>) -> Result<()> {
    const HEADER_ONLY: [FourCC; 5] = [
        ids::IMAGE_HEADER,
        ids::BITS_PER_COMPONENT,
        ids::CHANNEL_DEFINITION,
        ids::COMPONENT_MAPPING,
        ids::PALETTE,
    ];
    const HEADER_BOXES: [FourCC; 3] = [
        ids::JP2_HEADER,
        ids::CODESTREAM_HEADER,
        ids::COMPOSITING_LAYER_HEADER,
    ];

    for b in boxes {
        let id = b.box_id();
        if HEADER_ONLY.contains(&id) && !parent.is_some_and(|p| HEADER_BOXES.contains(&p)) {
            return Err(Error::InvalidStructure(format!(
                "the '{id}' box at offset {:?} may only appear directly \
                 within a header box",
                b.offset
            )));
        }
        if let Some(children) = b.children() {
            check_header_child_placement(children, Some(id))?;
        }
    }
    Ok(())
}

/// Rules 3 and 6: colour specification presence, method leniency, channel
/// definition coverage
fn check_colour_specification(
    boxes: &[Jp2Box],
    mode: Mode,
    jpx: bool,
    warnings: &mut Vec<StructuralWarning>,
) -> Result<()> {
    let jp2h = boxes
        .iter()
        .find(|b| b.box_id() == ids::JP2_HEADER)
        .expect("presence checked earlier");
    let children = jp2h.children().unwrap_or(&[]);

    let colrs: Vec<_> = children
        .iter()
        .filter_map(|b| match &b.data {
            BoxData::ColourSpecification(colr) => Some((b.offset.unwrap_or(0), colr)),
            _ => None,
        })
        .collect();

    if colrs.is_empty() {
        return Err(Error::InvalidStructure(
            "the JP2 header box must contain a colour specification box".into(),
        ));
    }

    if !jpx {
        for (offset, colr) in &colrs {
            if colr.method != ENUMERATED_COLORSPACE && colr.method != RESTRICTED_ICC_PROFILE {
                let finding = StructuralWarning::NonConformantColourMethod {
                    offset: *offset,
                    method: colr.method,
                };
                if mode == Mode::Writing {
                    return Err(Error::InvalidStructure(finding.to_string()));
                }
                warnings.push(finding);
            }
            if colr.approximation != 0 {
                let finding = StructuralWarning::InvalidApproximation {
                    offset: *offset,
                    approximation: colr.approximation,
                };
                if mode == Mode::Writing {
                    return Err(Error::InvalidStructure(finding.to_string()));
                }
                warnings.push(finding);
            }
            if let Some(colorspace) = colr.colorspace {
                if ![SRGB, GREYSCALE, YCC].contains(&colorspace) {
                    let finding = StructuralWarning::UnknownColourspace {
                        offset: *offset,
                        colorspace,
                    };
                    if mode == Mode::Writing {
                        return Err(Error::InvalidStructure(finding.to_string()));
                    }
                    warnings.push(finding);
                }
            }
        }
    }

    // a channel definition box must cover every channel the colourspace
    // implies
    let cdef = children.iter().find_map(|b| match &b.data {
        BoxData::ChannelDefinition(cdef) => Some(cdef),
        _ => None,
    });

    if let Some(cdef) = cdef {
        let colorspace = colrs.iter().find_map(|(_, colr)| colr.colorspace);
        match colorspace {
            Some(SRGB) => {
                for channel in 0u16..3 {
                    let covered = cdef
                        .association
                        .iter()
                        .zip(&cdef.channel_type)
                        .any(|(assoc, typ)| *assoc == channel + 1 && *typ == 0);
                    if !covered {
                        return Err(Error::InvalidStructure(format!(
                            "the channel definition box does not define colour \
                             channel {channel}"
                        )));
                    }
                }
            }
            Some(GREYSCALE) => {
                if !cdef.channel_type.contains(&0) {
                    return Err(Error::InvalidStructure(
                        "the channel definition box defines no colour channel \
                         for a greyscale image"
                            .into(),
                    ));
                }
            }
            _ => {}
        }
    }

    Ok(())
}

/// Rule 4: a codestream box exists at top level, after the header box
fn check_codestream_placement(
    boxes: &[Jp2Box],
    warnings: &mut Vec<StructuralWarning>,
) -> Result<()> {
    let jp2c_positions: Vec<usize> = boxes
        .iter()
        .enumerate()
        .filter(|(_, b)| b.box_id() == ids::CODESTREAM)
        .map(|(idx, _)| idx)
        .collect();

    if jp2c_positions.is_empty() {
        return Err(Error::InvalidStructure(
            "a codestream box was not found in the outermost level of boxes".into(),
        ));
    }

    if jp2c_positions.len() > 1 {
        warnings.push(StructuralWarning::MultipleCodestreamBoxes {
            count: jp2c_positions.len(),
        });
    }

    let jp2h_position = boxes
        .iter()
        .position(|b| b.box_id() == ids::JP2_HEADER)
        .expect("presence checked earlier");

    if jp2h_position >= jp2c_positions[0] {
        return Err(Error::InvalidStructure(
            "the codestream box must be preceded by the JP2 header box".into(),
        ));
    }

    Ok(())
}

/// Plain-JP2 rule: every box id must be one this reader recognizes
fn check_no_unrecognized_boxes(boxes: &[Jp2Box]) -> Result<()> {
    for b in boxes {
        if let BoxData::Unknown { id, .. } = &b.data {
            return Err(Error::InvalidStructure(format!(
                "unrecognized box '{id}' at offset {:?} is not allowed under \
                 the 'jp2 ' brand",
                b.offset
            )));
        }
        if let Some(children) = b.children() {
            check_no_unrecognized_boxes(children)?;
        }
    }
    Ok(())
}

/// Rule 5: the extended JPX rule set
fn check_jpx_rules(boxes: &[Jp2Box]) -> Result<()> {
    let ftyp = match &boxes[1].data {
        BoxData::FileType(ftyp) => ftyp,
        _ => unreachable!("checked earlier"),
    };

    check_jpx_label_placement(boxes, None)?;

    // association and number list boxes need the jpx brands declared
    let jpx_compatible = ftyp.is_compatible_with(brands::JPX)
        || ftyp.is_compatible_with(brands::JPX_BASELINE);
    if contains_box_recursive(boxes, ids::ASSOCIATION)
        || contains_box_recursive(boxes, ids::NUMBER_LIST)
    {
        if !jpx_compatible {
            return Err(Error::InvalidStructure(
                "association and number list boxes require 'jpx ' or 'jpxb' \
                 in the file type compatibility list"
                    .into(),
            ));
        }
    }

    // dtbl: top-level singleton, and only meaningful with fragment tables
    let top_level_dtbl = boxes
        .iter()
        .filter(|b| b.box_id() == ids::DATA_REFERENCE)
        .count();
    let dtbl_anywhere = count_box_recursive(boxes, ids::DATA_REFERENCE);

    if dtbl_anywhere > top_level_dtbl {
        return Err(Error::InvalidStructure(
            "a data reference box may only appear at the top level".into(),
        ));
    }
    if top_level_dtbl > 1 {
        return Err(Error::InvalidStructure(format!(
            "{top_level_dtbl} data reference boxes found; at most one is allowed"
        )));
    }
    if top_level_dtbl == 1 && !contains_box_recursive(boxes, ids::FRAGMENT_TABLE) {
        return Err(Error::InvalidStructure(
            "a data reference box requires a fragment table box".into(),
        ));
    }

    Ok(())
}

/// Label boxes are restricted to association, codestream header, and
/// compositing layer header containers
fn check_jpx_label_placement(boxes: &[Jp2Box], parent: Option<FourCC>) -> Result<()> {
    const LABEL_CONTAINERS: [FourCC; 3] = [
        ids::ASSOCIATION,
        ids::CODESTREAM_HEADER,
        ids::COMPOSITING_LAYER_HEADER,
    ];

    for b in boxes {
        let id = b.box_id();
        if id == ids::LABEL {
            match parent {
                Some(p) if LABEL_CONTAINERS.contains(&p) => {}
                _ => {
                    return Err(Error::InvalidStructure(format!(
                        "a label box at offset {:?} may only appear within an \
                         association, codestream header, or compositing layer \
                         header box",
                        b.offset
                    )))
                }
            }
        }
        if let Some(children) = b.children() {
            check_jpx_label_placement(children, Some(id))?;
        }
    }
    Ok(())
}

fn contains_box_recursive(boxes: &[Jp2Box], id: FourCC) -> bool {
    count_box_recursive(boxes, id) > 0
}

fn count_box_recursive(boxes: &[Jp2Box], id: FourCC) -> usize {
    boxes
        .iter()
        .map(|b| {
            let own = usize::from(b.box_id() == id);
            own + b
                .children()
                .map(|c| count_box_recursive(c, id))
                .unwrap_or(0)
        })
        .sum()
}

/// Cross-check the image header box against the codestream SIZ segment
///
/// The declared (height, width, component count) must agree; disagreement
/// flags the file but does not make it unusable.
pub fn cross_check_dimensions(
    ihdr: &crate::boxes::ImageHeaderBox,
    siz: &SizSegment,
) -> Option<StructuralWarning> {
    let ihdr_dims = (ihdr.height, ihdr.width, ihdr.num_components);
    let siz_dims = (siz.ysiz, siz.xsiz, siz.num_components());
    if ihdr_dims != siz_dims {
        Some(StructuralWarning::DimensionMismatch {
            ihdr: ihdr_dims,
            siz: siz_dims,
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::{
        ChannelDefinitionBox, ColourSpecificationBox, ContiguousCodestreamBox, FileTypeBox,
        ImageHeaderBox, LabelBox, SignatureBox,
    };

    fn minimal_boxes() -> Vec<Jp2Box> {
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
                vec![0xff, 0x4f],
            ))),
        ]
    }

    #[test]
    fn test_minimal_file_is_valid() {
        let warnings = validate(&minimal_boxes(), Mode::Reading).unwrap();
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_file_type_before_signature_is_fatal() {
        let mut boxes = minimal_boxes();
        boxes.swap(0, 1);
        assert!(matches!(
            validate(&boxes, Mode::Reading),
            Err(Error::InvalidStructure(_))
        ));
    }

    #[test]
    fn test_codestream_before_header_is_fatal() {
        let mut boxes = minimal_boxes();
        boxes.swap(2, 3);
        assert!(matches!(
            validate(&boxes, Mode::Reading),
            Err(Error::InvalidStructure(_))
        ));
    }

    #[test]
    fn test_missing_codestream_is_fatal() {
        let mut boxes = minimal_boxes();
        boxes.pop();
        assert!(matches!(
            validate(&boxes, Mode::Reading),
            Err(Error::InvalidStructure(_))
        ));
    }

    #[test]
    fn test_header_without_image_header_first_is_fatal() {
        let mut boxes = minimal_boxes();
        if let BoxData::Jp2Header(children) = &mut boxes[2].data {
            children.swap(0, 1);
        }
        assert!(matches!(
            validate(&boxes, Mode::Reading),
            Err(Error::InvalidStructure(_))
        ));
    }

    #[test]
    fn test_header_child_at_top_level_is_fatal() {
        let mut boxes = minimal_boxes();
        boxes.insert(
            2,
            Jp2Box::new(BoxData::ChannelDefinition(ChannelDefinitionBox {
                index: vec![0],
                channel_type: vec![0],
                association: vec![1],
            })),
        );
        assert!(matches!(
            validate(&boxes, Mode::Reading),
            Err(Error::InvalidStructure(_))
        ));
    }

    #[test]
    fn test_missing_colour_specification_is_fatal() {
        let mut boxes = minimal_boxes();
        if let BoxData::Jp2Header(children) = &mut boxes[2].data {
            children.pop();
        }
        assert!(matches!(
            validate(&boxes, Mode::Reading),
            Err(Error::InvalidStructure(_))
        ));
    }

    #[test]
    fn test_incomplete_channel_definition_is_fatal() {
        let mut boxes = minimal_boxes();
        if let BoxData::Jp2Header(children) = &mut boxes[2].data {
            // covers only channels 1 and 2, never channel 3
            children.push(Jp2Box::new(BoxData::ChannelDefinition(
                ChannelDefinitionBox {
                    index: vec![0, 1],
                    channel_type: vec![0, 0],
                    association: vec![1, 2],
                },
            )));
        }
        assert!(matches!(
            validate(&boxes, Mode::Reading),
            Err(Error::InvalidStructure(_))
        ));
    }

    #[test]
    fn test_complete_channel_definition_is_accepted() {
        let mut boxes = minimal_boxes();
        if let BoxData::Jp2Header(children) = &mut boxes[2].data {
            children.push(Jp2Box::new(BoxData::ChannelDefinition(
                ChannelDefinitionBox {
                    index: vec![0, 1, 2],
                    channel_type: vec![0, 0, 0],
                    association: vec![1, 2, 3],
                },
            )));
        }
        validate(&boxes, Mode::Reading).unwrap();
    }

    #[test]
    fn test_bad_colour_method_warns_when_reading_fails_when_writing() {
        let mut boxes = minimal_boxes();
        if let BoxData::Jp2Header(children) = &mut boxes[2].data {
            if let BoxData::ColourSpecification(colr) = &mut children[1].data {
                colr.method = 5;
            }
        }

        let warnings = validate(&boxes, Mode::Reading).unwrap();
        assert!(warnings
            .iter()
            .any(|w| matches!(w, StructuralWarning::NonConformantColourMethod { .. })));

        assert!(matches!(
            validate(&boxes, Mode::Writing),
            Err(Error::InvalidStructure(_))
        ));
    }

    #[test]
    fn test_multiple_codestreams_warn() {
        let mut boxes = minimal_boxes();
        boxes.push(Jp2Box::new(BoxData::Codestream(
            ContiguousCodestreamBox::from_bytes(vec![0xff, 0x4f]),
        )));
        let warnings = validate(&boxes, Mode::Reading).unwrap();
        assert!(warnings
            .iter()
            .any(|w| matches!(w, StructuralWarning::MultipleCodestreamBoxes { count: 2 })));
    }

    #[test]
    fn test_unknown_box_fatal_under_jp2_tolerated_under_jpx() {
        let mut boxes = minimal_boxes();
        boxes.push(Jp2Box::new(BoxData::Unknown {
            id: FourCC(*b"zzzz"),
            data: vec![],
        }));
        assert!(matches!(
            validate(&boxes, Mode::Reading),
            Err(Error::InvalidStructure(_))
        ));

        if let BoxData::FileType(ftyp) = &mut boxes[1].data {
            ftyp.brand = brands::JPX;
            ftyp.compatibility_list = vec![brands::JP2, brands::JPX];
        }
        validate(&boxes, Mode::Reading).unwrap();
    }

    #[test]
    fn test_jpx_label_placement() {
        let mut boxes = minimal_boxes();
        if let BoxData::FileType(ftyp) = &mut boxes[1].data {
            ftyp.brand = brands::JPX;
            ftyp.compatibility_list = vec![brands::JP2, brands::JPX];
        }

        // a label inside an association box is fine
        boxes.push(Jp2Box::new(BoxData::Association(vec![Jp2Box::new(
            BoxData::Label(LabelBox {
                label: "scene".into(),
            }),
        )])));
        validate(&boxes, Mode::Reading).unwrap();

        // a top-level label is not
        boxes.push(Jp2Box::new(BoxData::Label(LabelBox {
            label: "loose".into(),
        })));
        assert!(matches!(
            validate(&boxes, Mode::Reading),
            Err(Error::InvalidStructure(_))
        ));
    }

    #[test]
    fn test_jpx_association_needs_brand_compatibility() {
        let mut boxes = minimal_boxes();
        if let BoxData::FileType(ftyp) = &mut boxes[1].data {
            ftyp.brand = brands::JPX;
            // deliberately missing jpx/jpxb from the compatibility list
            ftyp.compatibility_list = vec![brands::JP2];
        }
        boxes.push(Jp2Box::new(BoxData::Association(vec![])));
        assert!(matches!(
            validate(&boxes, Mode::Reading),
            Err(Error::InvalidStructure(_))
        ));
    }

    #[test]
    fn test_dimension_cross_check() {
        use crate::codestream::tests::synthetic_codestream;
        use crate::codestream::{Codestream, ParseOptions};
        use std::io::Cursor;

        let data = synthetic_codestream(200, 100, 3);
        let mut cursor = Cursor::new(data.clone());
        let cs =
            Codestream::parse(&mut cursor, data.len() as u64, &ParseOptions::default()).unwrap();
        let siz = cs.siz().unwrap();

        let ihdr = ImageHeaderBox::new(100, 200, 3);
        assert!(cross_check_dimensions(&ihdr, siz).is_none());

        let ihdr = ImageHeaderBox::new(100, 201, 3);
        let warning = cross_check_dimensions(&ihdr, siz).unwrap();
        assert!(matches!(
            warning,
            StructuralWarning::DimensionMismatch { .. }
        ));
    }
}
