//! XMP packet helpers
//!
//! XMP metadata is an XML-based RDF packet. Before a captured packet is
//! committed to a UUID box we check it is well-formed; a broken packet would
//! travel silently otherwise, since the box model treats it as opaque bytes.

use quick_xml::{events::Event, Reader};

/// The APP1 namespace prefix identifying an XMP segment in a JPEG file
pub const JPEG_XMP_HEADER: &[u8] = b"http://ns.adobe.com/xap/1.0/";

/// Check that a byte buffer parses as well-formed XML
pub fn is_well_formed(packet: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(packet) else {
        return false;
    };

    let mut reader = Reader::from_str(text);
    let mut depth = 0usize;
    let mut saw_element = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(_)) => {
                depth += 1;
                saw_element = true;
            }
            Ok(Event::End(_)) => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
            }
            Ok(Event::Empty(_)) => saw_element = true,
            Ok(Event::Eof) => return depth == 0 && saw_element,
            Ok(_) => {}
            Err(_) => return false,
        }
    }
}

/// Split the XMP packet body out of a JPEG APP1 segment payload
///
/// The payload begins with the namespace URI and a NUL; everything after is
/// the packet.
pub fn from_app1_segment(payload: &[u8]) -> Option<&[u8]> {
    if payload.len() > JPEG_XMP_HEADER.len() + 1 && payload.starts_with(JPEG_XMP_HEADER) {
        Some(&payload[JPEG_XMP_HEADER.len() + 1..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PACKET: &str = r#"<?xpacket begin="" id="W5M0MpCehiHzreSzNTczkc9d"?>
<x:xmpmeta xmlns:x="adobe:ns:meta/">
  <rdf:RDF xmlns:rdf="http://www.w3.org/1999/02/22-rdf-syntax-ns#">
    <rdf:Description rdf:about="" dc:title="test"
      xmlns:dc="http://purl.org/dc/elements/1.1/"/>
  </rdf:RDF>
</x:xmpmeta>
<?xpacket end="w"?>"#;

    #[test]
    fn test_well_formed_packet() {
        assert!(is_well_formed(PACKET.as_bytes()));
    }

    #[test]
    fn test_malformed_packet() {
        assert!(!is_well_formed(b"<unclosed>"));
        assert!(!is_well_formed(b"no xml here"));
        assert!(!is_well_formed(&[0xff, 0xfe, 0x00]));
    }

    #[test]
    fn test_app1_split() {
        let mut payload = JPEG_XMP_HEADER.to_vec();
        payload.push(0);
        payload.extend_from_slice(PACKET.as_bytes());
        assert_eq!(from_app1_segment(&payload), Some(PACKET.as_bytes()));

        assert_eq!(from_app1_segment(b"Exif\0\0whatever"), None);
    }
}
