//! Raw DNS wire helpers
//!
//! Full message parsing and composition go through `hickory_proto`; this
//! module covers the places where a full parse is either wasteful or
//! impossible:
//!
//! - ingress header validation before any allocation happens,
//! - question sniffing on outbound replies, where even a malformed packet
//!   must still yield its id and question for near-miss accounting,
//! - response truncation against the client's advertised payload size.
//!
//! The raw name parser enforces the RFC 1035 limits directly: labels are
//! at most 63 octets, names at most 255 wire octets, and compression
//! pointers must point strictly backwards (which is also what makes the
//! parser loop-free).
//!
//! # Example
//!
//! ```
//! use rust_recursor::wire::sniff_question;
//!
//! // header (id 0x1234) + "www.example.com. A IN"
//! let mut packet = vec![0x12, 0x34, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
//! packet.extend_from_slice(&[3, b'w', b'w', b'w', 7, b'e', b'x', b'a', b'm', b'p', b'l', b'e']);
//! packet.extend_from_slice(&[3, b'c', b'o', b'm', 0, 0, 1, 0, 1]);
//!
//! let q = sniff_question(&packet).unwrap();
//! assert_eq!(q.qname, "www.example.com.");
//! assert_eq!(q.qtype, 1);
//! ```

pub mod ecs;

use hickory_proto::op::Message;

use crate::error::{ResolverError, Result};

/// Size of the fixed DNS header
pub const DNS_HEADER_SIZE: usize = 12;

/// Maximum length of a single label
pub const MAX_LABEL_LEN: usize = 63;

/// Maximum uncompressed wire length of a name, terminal root included
pub const MAX_NAME_WIRE_LEN: usize = 255;

/// The OPT pseudo-record type
pub const TYPE_OPT: u16 = 41;

/// Decoded fixed header of a DNS message
///
/// Only the fields the ingress and reply-matching paths look at; everything
/// else waits for the full parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHeader {
    /// Transaction id
    pub id: u16,
    /// The two flag bytes, undecoded
    pub flags: u16,
    /// Question count
    pub qdcount: u16,
    /// Answer count
    pub ancount: u16,
    /// Authority count
    pub nscount: u16,
    /// Additional count
    pub arcount: u16,
}

impl RawHeader {
    /// Whether this is a response
    #[must_use]
    pub fn qr(&self) -> bool {
        self.flags & 0x8000 != 0
    }

    /// The opcode field
    #[must_use]
    pub fn opcode(&self) -> u8 {
        ((self.flags >> 11) & 0x0F) as u8
    }

    /// Whether the TC bit is set
    #[must_use]
    pub fn tc(&self) -> bool {
        self.flags & 0x0200 != 0
    }

    /// Whether recursion is desired
    #[must_use]
    pub fn rd(&self) -> bool {
        self.flags & 0x0100 != 0
    }

    /// The response code field (without extended RCODE bits)
    #[must_use]
    pub fn rcode(&self) -> u8 {
        (self.flags & 0x000F) as u8
    }
}

/// Read the fixed header from the front of a packet
///
/// # Errors
///
/// Returns a parse error for buffers shorter than the 12-byte header.
pub fn peek_header(packet: &[u8]) -> Result<RawHeader> {
    if packet.len() < DNS_HEADER_SIZE {
        return Err(ResolverError::parse(format!(
            "packet smaller than DNS header: {} bytes",
            packet.len()
        )));
    }
    let u16_at = |i: usize| u16::from_be_bytes([packet[i], packet[i + 1]]);
    Ok(RawHeader {
        id: u16_at(0),
        flags: u16_at(2),
        qdcount: u16_at(4),
        ancount: u16_at(6),
        nscount: u16_at(8),
        arcount: u16_at(10),
    })
}

/// Parse a possibly-compressed name starting at `start`
///
/// Returns the canonical lowercase presentation (always with a trailing
/// dot, `.` alone for the root) and the offset just past the name at the
/// top level (past the pointer, if the name was compressed).
///
/// # Errors
///
/// Rejects labels longer than 63 octets (any length byte with the `01` or
/// `10` top bits), names whose uncompressed form exceeds 255 wire octets,
/// compression pointers that do not point strictly backwards, and reads
/// past the end of the buffer.
pub fn parse_name(packet: &[u8], start: usize) -> Result<(String, usize)> {
    let mut pos = start;
    let mut name = String::new();
    // Uncompressed wire length accumulated so far, terminal root excluded.
    let mut wire_len = 0usize;
    let mut end_at_top: Option<usize> = None;

    loop {
        let len_byte = *packet
            .get(pos)
            .ok_or_else(|| ResolverError::parse("name runs past end of packet"))?;

        if len_byte == 0 {
            if wire_len + 1 > MAX_NAME_WIRE_LEN {
                return Err(ResolverError::parse("name exceeds 255 wire octets"));
            }
            if name.is_empty() {
                name.push('.');
            }
            return Ok((name, end_at_top.unwrap_or(pos + 1)));
        }

        match len_byte & 0xC0 {
            0x00 => {
                let len = len_byte as usize;
                debug_assert!(len <= MAX_LABEL_LEN);
                wire_len += len + 1;
                if wire_len + 1 > MAX_NAME_WIRE_LEN {
                    return Err(ResolverError::parse("name exceeds 255 wire octets"));
                }
                let label = packet
                    .get(pos + 1..pos + 1 + len)
                    .ok_or_else(|| ResolverError::parse("label runs past end of packet"))?;
                for &b in label {
                    name.push(b.to_ascii_lowercase() as char);
                }
                name.push('.');
                pos += len + 1;
            }
            0xC0 => {
                let second = *packet
                    .get(pos + 1)
                    .ok_or_else(|| ResolverError::parse("pointer runs past end of packet"))?;
                let target = ((usize::from(len_byte) & 0x3F) << 8) | usize::from(second);
                if target >= pos {
                    return Err(ResolverError::parse(
                        "compression pointer does not point backwards",
                    ));
                }
                if end_at_top.is_none() {
                    end_at_top = Some(pos + 2);
                }
                pos = target;
            }
            // 0x40 and 0x80 label types were never standardized; a length
            // byte in 64..=191 therefore also covers "label longer than 63".
            _ => return Err(ResolverError::parse("invalid label type")),
        }
    }
}

/// Skip over a name without materializing it
///
/// Same validity rules as [`parse_name`].
pub fn skip_name(packet: &[u8], start: usize) -> Result<usize> {
    parse_name(packet, start).map(|(_, end)| end)
}

/// The first question of a message, read straight off the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniffedQuestion {
    /// Transaction id
    pub id: u16,
    /// Lowercase presentation of QNAME, trailing dot included
    pub qname: String,
    /// QTYPE
    pub qtype: u16,
    /// QCLASS
    pub qclass: u16,
    /// Offset just past the question section entry
    pub end: usize,
}

/// Read the header and first question of a raw packet
///
/// # Errors
///
/// Fails on a short header, `qdcount == 0`, or an invalid QNAME per the
/// [`parse_name`] rules.
pub fn sniff_question(packet: &[u8]) -> Result<SniffedQuestion> {
    let header = peek_header(packet)?;
    if header.qdcount == 0 {
        return Err(ResolverError::parse("no question section"));
    }
    let (qname, after_name) = parse_name(packet, DNS_HEADER_SIZE)?;
    let fixed = packet
        .get(after_name..after_name + 4)
        .ok_or_else(|| ResolverError::parse("question runs past end of packet"))?;
    Ok(SniffedQuestion {
        id: header.id,
        qname,
        qtype: u16::from_be_bytes([fixed[0], fixed[1]]),
        qclass: u16::from_be_bytes([fixed[2], fixed[3]]),
        end: after_name + 4,
    })
}

/// Serialize a response, truncating it to fit `limit` bytes
///
/// Records are dropped from the back of the additional section first, then
/// authority, then answers, until the message fits; TC is set as soon as
/// anything is dropped. The OPT record rides in the message's EDNS slot
/// and survives truncation.
///
/// # Errors
///
/// Returns a serialization error if encoding fails outright.
pub fn truncate_to_size(message: &mut Message, limit: usize) -> Result<Vec<u8>> {
    let mut bytes = message
        .to_vec()
        .map_err(|e| ResolverError::serialize(e.to_string()))?;
    if bytes.len() <= limit {
        return Ok(bytes);
    }

    message.set_truncated(true);
    while bytes.len() > limit {
        if !drop_last_record(message) {
            break;
        }
        bytes = message
            .to_vec()
            .map_err(|e| ResolverError::serialize(e.to_string()))?;
    }
    Ok(bytes)
}

/// Drop the last record of the last non-empty section; false when only the
/// header, question and OPT remain.
fn drop_last_record(message: &mut Message) -> bool {
    let mut additionals = message.take_additionals();
    if additionals.pop().is_some() {
        for r in additionals {
            message.add_additional(r);
        }
        return true;
    }

    let mut authorities = message.take_name_servers();
    if authorities.pop().is_some() {
        for r in authorities {
            message.add_name_server(r);
        }
        return true;
    }

    let mut answers = message.take_answers();
    if answers.pop().is_some() {
        for r in answers {
            message.add_answer(r);
        }
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
    use std::str::FromStr;

    // ========================================================================
    // Helper Functions
    // ========================================================================

    fn query_packet(id: u16, labels: &[&[u8]], qtype: u16) -> Vec<u8> {
        let mut packet = Vec::new();
        packet.extend_from_slice(&id.to_be_bytes());
        packet.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
        for label in labels {
            packet.push(label.len() as u8);
            packet.extend_from_slice(label);
        }
        packet.push(0);
        packet.extend_from_slice(&qtype.to_be_bytes());
        packet.extend_from_slice(&1u16.to_be_bytes());
        packet
    }

    // ========================================================================
    // Header Tests
    // ========================================================================

    #[test]
    fn test_peek_header_too_short() {
        assert!(peek_header(&[0u8; 11]).is_err());
        assert!(peek_header(&[]).is_err());
    }

    #[test]
    fn test_peek_header_fields() {
        let packet = query_packet(0xBEEF, &[b"example", b"com"], 1);
        let header = peek_header(&packet).unwrap();
        assert_eq!(header.id, 0xBEEF);
        assert_eq!(header.qdcount, 1);
        assert_eq!(header.arcount, 0);
        assert!(!header.qr());
        assert_eq!(header.opcode(), 0);
    }

    #[test]
    fn test_header_flag_decoding() {
        // QR=1, opcode=0, TC=1, RD=1, RCODE=3
        let flags: u16 = 0x8000 | 0x0200 | 0x0100 | 0x0003;
        let mut packet = vec![0x00, 0x01];
        packet.extend_from_slice(&flags.to_be_bytes());
        packet.extend_from_slice(&[0u8; 8]);
        let header = peek_header(&packet).unwrap();
        assert!(header.qr());
        assert!(header.tc());
        assert!(header.rd());
        assert_eq!(header.rcode(), 3);
    }

    // ========================================================================
    // Name Parsing: Boundary Cases
    // ========================================================================

    #[test]
    fn test_label_of_63_parses() {
        let label = [b'a'; 63];
        let packet = query_packet(1, &[&label], 1);
        let q = sniff_question(&packet).unwrap();
        assert_eq!(q.qname.len(), 64); // 63 + trailing dot
    }

    #[test]
    fn test_label_of_64_fails() {
        // A length byte of 64 has the reserved 01 top bits.
        let mut packet = vec![0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        packet.push(64);
        packet.extend_from_slice(&[b'a'; 64]);
        packet.push(0);
        packet.extend_from_slice(&[0, 1, 0, 1]);
        assert!(sniff_question(&packet).is_err());
    }

    #[test]
    fn test_name_of_255_wire_octets_parses() {
        // 3 * (1+63) + (1+61) + 1 = 255
        let l63 = [b'a'; 63];
        let l61 = [b'b'; 61];
        let packet = query_packet(1, &[&l63, &l63, &l63, &l61], 1);
        assert!(sniff_question(&packet).is_ok());
    }

    #[test]
    fn test_name_of_256_wire_octets_fails() {
        // 3 * (1+63) + (1+62) + 1 = 256
        let l63 = [b'a'; 63];
        let l62 = [b'b'; 62];
        let packet = query_packet(1, &[&l63, &l63, &l63, &l62], 1);
        assert!(sniff_question(&packet).is_err());
    }

    #[test]
    fn test_pointer_to_offset_zero_parses() {
        // buffer: label "a", root, then a pointer back to offset 0
        let packet = [1, b'a', 0, 0xC0, 0x00];
        let (name, end) = parse_name(&packet, 3).unwrap();
        assert_eq!(name, "a.");
        assert_eq!(end, 5);
    }

    #[test]
    fn test_pointer_to_current_offset_fails() {
        let packet = [0, 0, 0xC0, 0x02];
        assert!(parse_name(&packet, 2).is_err());
    }

    #[test]
    fn test_pointer_forwards_fails() {
        let packet = [0xC0, 0x03, 0, 1, b'a', 0];
        assert!(parse_name(&packet, 0).is_err());
    }

    #[test]
    fn test_pointer_loop_rejected() {
        // label "a" at 0 followed by a pointer back to 0: expanding the
        // cycle trips the 255-octet cap instead of spinning forever
        let packet = [1, b'a', 0xC0, 0x00, 0, 0];
        assert!(parse_name(&packet, 2).is_err());
    }

    #[test]
    fn test_root_name() {
        let packet = query_packet(7, &[], 2);
        let q = sniff_question(&packet).unwrap();
        assert_eq!(q.qname, ".");
        assert_eq!(q.qtype, 2);
    }

    #[test]
    fn test_qname_lowercased() {
        let packet = query_packet(7, &[b"WWW", b"ExAmPlE", b"COM"], 1);
        let q = sniff_question(&packet).unwrap();
        assert_eq!(q.qname, "www.example.com.");
    }

    #[test]
    fn test_compressed_question_name() {
        // header, then "com." at offset 12, then question name "example" +
        // pointer to 12
        let mut packet = vec![0, 9, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(&[3, b'c', b'o', b'm', 0]);
        let qname_start = packet.len();
        packet.extend_from_slice(&[7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0xC0, 12]);
        packet.extend_from_slice(&[0, 1, 0, 1]);
        let (name, end) = parse_name(&packet, qname_start).unwrap();
        assert_eq!(name, "example.com.");
        assert_eq!(end, qname_start + 10);
    }

    #[test]
    fn test_sniff_no_question() {
        let packet = [0u8; 12];
        assert!(sniff_question(&packet).is_err());
    }

    #[test]
    fn test_truncated_question_fails() {
        let mut packet = query_packet(1, &[b"example", b"com"], 1);
        packet.truncate(packet.len() - 3);
        assert!(sniff_question(&packet).is_err());
    }

    // ========================================================================
    // Compose/Parse Round Trip
    // ========================================================================

    #[test]
    fn test_composed_message_round_trips() {
        let name = Name::from_str("www.example.com.").unwrap();
        let mut message = Message::new();
        message.set_id(0xABCD);
        message.set_message_type(MessageType::Response);
        message.set_recursion_desired(true);
        message.set_recursion_available(true);
        message.add_query(Query::query(name.clone(), RecordType::A));
        message.add_answer(a_record(&name, 1));
        message.add_answer(a_record(&name, 2));
        message.add_name_server(a_record(&Name::from_str("example.com.").unwrap(), 3));

        let bytes = message.to_vec().unwrap();
        let parsed = Message::from_vec(&bytes).unwrap();

        assert_eq!(parsed.id(), message.id());
        assert_eq!(parsed.queries(), message.queries());
        assert_eq!(parsed.answers(), message.answers());
        assert_eq!(parsed.name_servers(), message.name_servers());
        assert_eq!(parsed.recursion_desired(), message.recursion_desired());

        // and the sniffer agrees with the full parser
        let sniffed = sniff_question(&bytes).unwrap();
        assert_eq!(sniffed.id, 0xABCD);
        assert_eq!(sniffed.qname, "www.example.com.");
        assert_eq!(sniffed.qtype, 1);
    }

    // ========================================================================
    // Truncation Tests
    // ========================================================================

    fn a_record(name: &Name, last_octet: u8) -> Record {
        let mut record = Record::new();
        record.set_name(name.clone());
        record.set_record_type(RecordType::A);
        record.set_dns_class(DNSClass::IN);
        record.set_ttl(60);
        record.set_data(Some(RData::A(A(std::net::Ipv4Addr::new(
            192, 0, 2, last_octet,
        )))));
        record
    }

    fn big_response(answers: usize) -> Message {
        let name = Name::from_str("host.example.com.").unwrap();
        let mut message = Message::new();
        message.set_id(0x42);
        message.set_message_type(MessageType::Response);
        message.add_query(Query::query(name.clone(), RecordType::A));
        for i in 0..answers {
            message.add_answer(a_record(&name, (i % 250) as u8));
        }
        message
    }

    #[test]
    fn test_no_truncation_when_fits() {
        let mut message = big_response(2);
        let bytes = truncate_to_size(&mut message, 512).unwrap();
        assert!(bytes.len() <= 512);
        assert!(!message.truncated());
        assert_eq!(message.answers().len(), 2);
    }

    #[test]
    fn test_truncation_sets_tc_and_fits() {
        let mut message = big_response(40);
        let bytes = truncate_to_size(&mut message, 512).unwrap();
        assert!(bytes.len() <= 512);
        assert!(message.truncated());
        assert!(message.answers().len() < 40);
    }

    #[test]
    fn test_truncation_drops_additionals_before_answers() {
        let mut message = big_response(3);
        let glue_name = Name::from_str("ns1.example.com.").unwrap();
        for i in 0..30 {
            message.add_additional(a_record(&glue_name, i));
        }
        let bytes = truncate_to_size(&mut message, 200).unwrap();
        assert!(bytes.len() <= 200);
        // every additional goes before the first answer does
        if !message.answers().is_empty() {
            assert!(message.additionals().is_empty() || message.answers().len() == 3);
        }
    }

    #[test]
    fn test_truncation_header_only_floor() {
        let mut message = big_response(1);
        // an absurd limit still returns the header+question skeleton
        let bytes = truncate_to_size(&mut message, 12).unwrap();
        assert!(message.truncated());
        assert!(message.answers().is_empty());
        assert!(!bytes.is_empty());
    }
}
