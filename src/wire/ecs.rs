//! EDNS Client Subnet option handling
//!
//! Implements RFC 7871 at two levels:
//!
//! - [`ClientSubnet`]: encode/decode of the option payload itself, with
//!   address truncation and bit masking to the configured prefix length;
//! - raw packet surgery: locating the OPT record in a composed query,
//!   splicing an ECS option in (overwriting in place when the size is
//!   unchanged, shifting the tail otherwise), and stripping the OPT record
//!   entirely for no-EDNS retries.
//!
//! The splice path only accepts the one arrangement outgoing queries have
//! (`qdcount == 1, ancount == 0, nscount == 0, arcount <= 1`); anything
//! else is a composition bug upstream, not a packet to fix up.
//!
//! A malformed ECS payload on an incoming query is treated as "no ECS
//! present": [`ClientSubnet::parse`] returns `None` and the caller logs.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::{ResolverError, Result};
use crate::wire::{peek_header, skip_name, DNS_HEADER_SIZE, TYPE_OPT};

/// The ECS option code (RFC 7871)
pub const OPTION_CODE_ECS: u16 = 8;

/// ADDRESS FAMILY 1: IPv4
pub const FAMILY_IPV4: u16 = 1;

/// ADDRESS FAMILY 2: IPv6
pub const FAMILY_IPV6: u16 = 2;

/// A decoded EDNS Client Subnet option
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSubnet {
    /// ADDRESS FAMILY (1 = IPv4, 2 = IPv6)
    pub family: u16,
    /// SOURCE PREFIX-LENGTH
    pub source_prefix: u8,
    /// SCOPE PREFIX-LENGTH (0 on queries)
    pub scope_prefix: u8,
    /// ADDRESS, truncated to `ceil(source_prefix / 8)` octets
    pub address: Vec<u8>,
}

impl ClientSubnet {
    /// Build the option sent upstream for `client`
    ///
    /// The address is truncated to the per-family prefix length and the
    /// bits past the prefix are zeroed; SCOPE is 0 as required on queries.
    #[must_use]
    pub fn for_client(client: IpAddr, prefix_v4: u8, prefix_v6: u8) -> Self {
        let (family, bits, octets): (u16, u8, Vec<u8>) = match client {
            IpAddr::V4(v4) => (FAMILY_IPV4, prefix_v4.min(32), v4.octets().to_vec()),
            IpAddr::V6(v6) => (FAMILY_IPV6, prefix_v6.min(128), v6.octets().to_vec()),
        };
        let mut address = octets;
        address.truncate(usize::from(bits).div_ceil(8));
        if bits % 8 != 0 {
            if let Some(last) = address.last_mut() {
                *last &= 0xFFu8 << (8 - bits % 8);
            }
        }
        Self {
            family,
            source_prefix: bits,
            scope_prefix: 0,
            address,
        }
    }

    /// Decode an option payload; `None` for anything structurally wrong
    #[must_use]
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 4 {
            return None;
        }
        let family = u16::from_be_bytes([payload[0], payload[1]]);
        let source_prefix = payload[2];
        let scope_prefix = payload[3];
        let max_bits: u8 = match family {
            FAMILY_IPV4 => 32,
            FAMILY_IPV6 => 128,
            _ => return None,
        };
        if source_prefix > max_bits || scope_prefix > max_bits {
            return None;
        }
        let address = payload[4..].to_vec();
        if address.len() != usize::from(source_prefix).div_ceil(8) {
            return None;
        }
        Some(Self {
            family,
            source_prefix,
            scope_prefix,
            address,
        })
    }

    /// The option payload (FAMILY, SOURCE, SCOPE, ADDRESS)
    #[must_use]
    pub fn payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.address.len());
        out.extend_from_slice(&self.family.to_be_bytes());
        out.push(self.source_prefix);
        out.push(self.scope_prefix);
        out.extend_from_slice(&self.address);
        out
    }

    /// The full option: OPTION-CODE, OPTION-LENGTH, payload
    #[must_use]
    pub fn to_option_bytes(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut out = Vec::with_capacity(4 + payload.len());
        out.extend_from_slice(&OPTION_CODE_ECS.to_be_bytes());
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&payload);
        out
    }

    /// The address zero-padded back to its family's width
    #[must_use]
    pub fn padded_addr(&self) -> Option<IpAddr> {
        match self.family {
            FAMILY_IPV4 => {
                let mut octets = [0u8; 4];
                if self.address.len() > 4 {
                    return None;
                }
                octets[..self.address.len()].copy_from_slice(&self.address);
                Some(IpAddr::V4(octets.into()))
            }
            FAMILY_IPV6 => {
                let mut octets = [0u8; 16];
                if self.address.len() > 16 {
                    return None;
                }
                octets[..self.address.len()].copy_from_slice(&self.address);
                Some(IpAddr::V6(octets.into()))
            }
            _ => None,
        }
    }

    /// The network described by SOURCE PREFIX-LENGTH
    #[must_use]
    pub fn source_net(&self) -> Option<IpNet> {
        IpNet::new(self.padded_addr()?, self.source_prefix).ok()
    }

    /// The network an authority's answer applies to
    ///
    /// SCOPE 0 in a response means "good for everyone", which callers
    /// represent as the source network of the query they sent.
    #[must_use]
    pub fn scope_net(&self) -> Option<IpNet> {
        let prefix = if self.scope_prefix == 0 {
            self.source_prefix
        } else {
            self.scope_prefix
        };
        IpNet::new(self.padded_addr()?, prefix).ok()
    }
}

/// Where the OPT record sits inside a composed query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptLocation {
    /// Offset of the OPT owner name (the root label)
    pub owner_offset: usize,
    /// Offset of the two RDLENGTH bytes
    pub rdlen_offset: usize,
    /// Offset of the RDATA
    pub rdata_offset: usize,
    /// RDATA length
    pub rdlen: usize,
}

impl OptLocation {
    /// Total wire size of the OPT record
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.rdata_offset + self.rdlen - self.owner_offset
    }
}

/// Find the OPT record of a query in the only arrangement outgoing
/// queries use: one question, nothing else but the OPT itself.
///
/// # Errors
///
/// Fails when the section counts differ from `qd=1, an=0, ns=0, ar=1`,
/// when the single additional record is not an OPT, or when the packet is
/// truncated mid-record.
pub fn locate_opt(packet: &[u8]) -> Result<OptLocation> {
    let header = peek_header(packet)?;
    if header.qdcount != 1 || header.ancount != 0 || header.nscount != 0 || header.arcount != 1 {
        return Err(ResolverError::parse(format!(
            "unsupported section layout for OPT surgery: qd={} an={} ns={} ar={}",
            header.qdcount, header.ancount, header.nscount, header.arcount
        )));
    }

    let after_qname = skip_name(packet, DNS_HEADER_SIZE)?;
    let owner_offset = after_qname + 4;
    let after_owner = skip_name(packet, owner_offset)?;

    let fixed = packet
        .get(after_owner..after_owner + 8)
        .ok_or_else(|| ResolverError::parse("OPT record runs past end of packet"))?;
    let rrtype = u16::from_be_bytes([fixed[0], fixed[1]]);
    if rrtype != TYPE_OPT {
        return Err(ResolverError::parse("additional record is not an OPT"));
    }

    let rdlen_offset = after_owner + 6;
    let rdlen = usize::from(u16::from_be_bytes([fixed[6], fixed[7]]));
    let rdata_offset = rdlen_offset + 2;
    if packet.len() < rdata_offset + rdlen {
        return Err(ResolverError::parse("OPT RDATA runs past end of packet"));
    }

    Ok(OptLocation {
        owner_offset,
        rdlen_offset,
        rdata_offset,
        rdlen,
    })
}

/// Scan an OPT RDATA for an option; returns `(offset, total_len)` of the
/// whole option including its 4-byte header, or `None`
#[must_use]
pub fn find_option(rdata: &[u8], code: u16) -> Option<(usize, usize)> {
    let mut pos = 0usize;
    while pos + 4 <= rdata.len() {
        let this_code = u16::from_be_bytes([rdata[pos], rdata[pos + 1]]);
        let this_len = usize::from(u16::from_be_bytes([rdata[pos + 2], rdata[pos + 3]]));
        if pos + 4 + this_len > rdata.len() {
            return None;
        }
        if this_code == code {
            return Some((pos, 4 + this_len));
        }
        pos += 4 + this_len;
    }
    None
}

/// Result of [`apply_ecs`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcsApplied {
    /// Whether a whole OPT record had to be added
    pub edns_added: bool,
}

/// Attach (or replace) an ECS option on a composed query packet
///
/// Three cases, cheapest first: an existing ECS option of identical size
/// is overwritten in place; a size change splices the option and fixes the
/// OPT RDLENGTH; a query without any OPT gets one appended, advertising
/// `payload_size`, and its arcount incremented.
///
/// # Errors
///
/// Fails on section layouts other than a bare query (see [`locate_opt`]).
pub fn apply_ecs(
    packet: &mut Vec<u8>,
    client: IpAddr,
    prefix_v4: u8,
    prefix_v6: u8,
    payload_size: u16,
) -> Result<EcsApplied> {
    let subnet = ClientSubnet::for_client(client, prefix_v4, prefix_v6);
    splice_ecs(packet, &subnet, payload_size)
}

/// [`apply_ecs`] with a caller-built option
///
/// # Errors
///
/// Same failure cases as [`apply_ecs`].
pub fn splice_ecs(
    packet: &mut Vec<u8>,
    subnet: &ClientSubnet,
    payload_size: u16,
) -> Result<EcsApplied> {
    let header = peek_header(packet)?;
    let option = subnet.to_option_bytes();

    if header.arcount == 0 {
        if header.qdcount != 1 || header.ancount != 0 || header.nscount != 0 {
            return Err(ResolverError::parse(
                "unsupported section layout for OPT surgery",
            ));
        }
        // Fresh OPT RR: root owner, type, requestor payload size, zeroed
        // extended-rcode/flags TTL, then the option as its only RDATA.
        packet.push(0);
        packet.extend_from_slice(&TYPE_OPT.to_be_bytes());
        packet.extend_from_slice(&payload_size.to_be_bytes());
        packet.extend_from_slice(&[0, 0, 0, 0]);
        packet.extend_from_slice(&(option.len() as u16).to_be_bytes());
        packet.extend_from_slice(&option);
        packet[10..12].copy_from_slice(&1u16.to_be_bytes());
        return Ok(EcsApplied { edns_added: true });
    }

    let opt = locate_opt(packet)?;
    let rdata = &packet[opt.rdata_offset..opt.rdata_offset + opt.rdlen];

    match find_option(rdata, OPTION_CODE_ECS) {
        Some((ecs_offset, ecs_len)) if ecs_len == option.len() => {
            let start = opt.rdata_offset + ecs_offset;
            packet[start..start + ecs_len].copy_from_slice(&option);
        }
        Some((ecs_offset, ecs_len)) => {
            let new_rdlen = opt.rdlen - ecs_len + option.len();
            let start = opt.rdata_offset + ecs_offset;
            packet.splice(start..start + ecs_len, option.iter().copied());
            write_u16(packet, opt.rdlen_offset, new_rdlen as u16);
        }
        None => {
            let new_rdlen = opt.rdlen + option.len();
            let insert_at = opt.rdata_offset + opt.rdlen;
            packet.splice(insert_at..insert_at, option.iter().copied());
            write_u16(packet, opt.rdlen_offset, new_rdlen as u16);
        }
    }

    Ok(EcsApplied { edns_added: false })
}

/// Rewrite a packet without its OPT record, preserving everything else
///
/// Queries in the standard arrangement are handled by slicing the OPT off
/// the tail; anything richer is rewritten through a full reparse. A packet
/// with `arcount == 0` comes back unchanged.
///
/// # Errors
///
/// Fails when the packet cannot be parsed at all.
pub fn rewrite_without_opt(packet: &[u8]) -> Result<Vec<u8>> {
    let header = peek_header(packet)?;
    if header.arcount == 0 {
        return Ok(packet.to_vec());
    }

    if header.qdcount == 1 && header.ancount == 0 && header.nscount == 0 && header.arcount == 1 {
        if let Ok(opt) = locate_opt(packet) {
            let mut out = packet[..opt.owner_offset].to_vec();
            write_u16(&mut out, 10, 0);
            return Ok(out);
        }
    }

    // General case: responses carrying answers next to the OPT.
    let mut message = hickory_proto::op::Message::from_vec(packet)
        .map_err(|e| ResolverError::parse(e.to_string()))?;
    *message.extensions_mut() = None;
    message
        .to_vec()
        .map_err(|e| ResolverError::serialize(e.to_string()))
}

fn write_u16(packet: &mut [u8], offset: usize, value: u16) {
    packet[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}
