//! DNS wire format (RFC 1035): header, question and resource-record
//! codec with label compression on both encode and decode.
//!
//! ```text
//! +---------------------+
//! | Header              |
//! +---------------------+
//! | Question            | the question for the name server
//! +---------------------+
//! | Answer              | RRs answering the question
//! +---------------------+
//! | Authority           | RRs pointing toward an authority
//! +---------------------+
//! | Additional          | RRs holding additional information
//! +---------------------+
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use winnow::binary::be_u16;
use winnow::error::ContextError;
use winnow::prelude::*;

use crate::error::{Error, Result};

/// Result type for winnow parsers.
pub type PResult<T> = core::result::Result<T, winnow::error::ErrMode<ContextError>>;

pub const HEADER_LEN: usize = 12;

/// Longest full name, dots included.
pub const MAX_NAME_LEN: usize = 253;

/// Longest single label.
pub const MAX_LABEL_LEN: usize = 63;

/// Compression-pointer tag bits in a length octet.
const POINTER_MASK: u8 = 0xc0;

// header flag bits (first flag octet is the high byte)
const FLAG_QR: u16 = 1 << 15;
const FLAG_TC: u16 = 1 << 9;
const FLAG_RD: u16 = 1 << 8;
const RCODE_MASK: u16 = 0x000f;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    Ns,
    Cname,
    Soa,
    Ptr,
    Mx,
    Aaaa,
    Other(u16),
}

impl RecordType {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => Self::A,
            2 => Self::Ns,
            5 => Self::Cname,
            6 => Self::Soa,
            12 => Self::Ptr,
            15 => Self::Mx,
            28 => Self::Aaaa,
            other => Self::Other(other),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            Self::A => 1,
            Self::Ns => 2,
            Self::Cname => 5,
            Self::Soa => 6,
            Self::Ptr => 12,
            Self::Mx => 15,
            Self::Aaaa => 28,
            Self::Other(other) => *other,
        }
    }
}

/// The INternet class.
pub const CLASS_INET: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl DnsHeader {
    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }

    pub fn truncated(&self) -> bool {
        self.flags & FLAG_TC != 0
    }

    pub fn rcode(&self) -> u8 {
        (self.flags & RCODE_MASK) as u8
    }

    /// Parse the fixed 12-byte header.
    pub fn parse(input: &mut &[u8]) -> PResult<Self> {
        let id = be_u16.parse_next(input)?;
        let flags = be_u16.parse_next(input)?;
        let qdcount = be_u16.parse_next(input)?;
        let ancount = be_u16.parse_next(input)?;
        let nscount = be_u16.parse_next(input)?;
        let arcount = be_u16.parse_next(input)?;
        Ok(DnsHeader {
            id,
            flags,
            qdcount,
            ancount,
            nscount,
            arcount,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: RecordType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
    Other(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub rtype: RecordType,
    pub ttl: u32,
    pub data: RData,
}

/// A decoded DNS response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub id: u16,
    pub rcode: u8,
    pub truncated: bool,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
}

impl Response {
    /// First A record in the answer section.
    pub fn first_a(&self) -> Option<Ipv4Addr> {
        self.answers.iter().find_map(|r| match r.data {
            RData::A(addr) => Some(addr),
            _ => None,
        })
    }

    /// First address of either family.
    pub fn first_addr(&self) -> Option<IpAddr> {
        self.answers.iter().find_map(|r| match r.data {
            RData::A(addr) => Some(IpAddr::V4(addr)),
            RData::Aaaa(addr) => Some(IpAddr::V6(addr)),
            _ => None,
        })
    }

    /// Smallest TTL among the answers.
    pub fn min_ttl(&self) -> Option<u32> {
        self.answers.iter().map(|r| r.ttl).min()
    }
}

/// Append `name` in label-length form. Rejects oversized names/labels.
pub fn encode_name(name: &str, buf: &mut Vec<u8>) -> Result<()> {
    let trimmed = name.trim_end_matches('.');
    if trimmed.len() > MAX_NAME_LEN || trimmed.is_empty() {
        return Err(Error::InvalidName(name.to_string()));
    }
    for label in trimmed.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(Error::InvalidName(name.to_string()));
        }
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
    Ok(())
}

/// Build a recursive query for `hostname`.
pub fn encode_query(id: u16, hostname: &str, qtype: RecordType) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(HEADER_LEN + hostname.len() + 6);
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&FLAG_RD.to_be_bytes());
    buf.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    buf.extend_from_slice(&[0; 6]); // an/ns/ar counts
    encode_name(hostname, &mut buf)?;
    buf.extend_from_slice(&qtype.as_u16().to_be_bytes());
    buf.extend_from_slice(&CLASS_INET.to_be_bytes());
    Ok(buf)
}

/// Decode a (possibly compressed) name at `offset`. Returns the name and
/// the offset just past its in-place encoding.
pub fn decode_name(msg: &[u8], offset: usize) -> Result<(String, usize)> {
    let mut name = String::new();
    let mut pos = offset;
    let mut next = None; // offset after the first pointer
    let mut jumps = 0;

    loop {
        let &len = msg
            .get(pos)
            .ok_or_else(|| Error::Parse("truncated name".into()))?;
        if len & POINTER_MASK == POINTER_MASK {
            // 14-bit pointer into the message
            let &lo = msg
                .get(pos + 1)
                .ok_or_else(|| Error::Parse("truncated pointer".into()))?;
            if next.is_none() {
                next = Some(pos + 2);
            }
            pos = (usize::from(len & !POINTER_MASK) << 8) | usize::from(lo);
            jumps += 1;
            if jumps > MAX_NAME_LEN / 2 {
                return Err(Error::Parse("compression loop".into()));
            }
            continue;
        }
        if len == 0 {
            pos += 1;
            break;
        }
        let len = usize::from(len);
        if len > MAX_LABEL_LEN {
            return Err(Error::Parse("label too long".into()));
        }
        let label = msg
            .get(pos + 1..pos + 1 + len)
            .ok_or_else(|| Error::Parse("truncated label".into()))?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label));
        if name.len() > MAX_NAME_LEN {
            return Err(Error::Parse("name too long".into()));
        }
        pos += 1 + len;
    }
    Ok((name, next.unwrap_or(pos)))
}

/// Decode a complete response message.
pub fn decode(msg: &[u8]) -> Result<Response> {
    let mut input = msg;
    let header =
        DnsHeader::parse(&mut input).map_err(|e| Error::Parse(format!("dns header: {e}")))?;

    let mut offset = HEADER_LEN;
    let mut questions = Vec::with_capacity(header.qdcount as usize);
    for _ in 0..header.qdcount {
        let (name, next) = decode_name(msg, offset)?;
        let fixed = msg
            .get(next..next + 4)
            .ok_or_else(|| Error::Parse("truncated question".into()))?;
        questions.push(Question {
            name,
            qtype: RecordType::from_u16(u16::from_be_bytes([fixed[0], fixed[1]])),
        });
        offset = next + 4;
    }

    let mut answers = Vec::with_capacity(header.ancount as usize);
    for _ in 0..header.ancount {
        let (record, next) = decode_record(msg, offset)?;
        answers.push(record);
        offset = next;
    }
    // authority and additional sections are not interesting to a stub
    // resolver; parsing stops here.

    Ok(Response {
        id: header.id,
        rcode: header.rcode(),
        truncated: header.truncated(),
        questions,
        answers,
    })
}

fn decode_record(msg: &[u8], offset: usize) -> Result<(Record, usize)> {
    let (name, next) = decode_name(msg, offset)?;
    let fixed = msg
        .get(next..next + 10)
        .ok_or_else(|| Error::Parse("truncated record".into()))?;
    let rtype = RecordType::from_u16(u16::from_be_bytes([fixed[0], fixed[1]]));
    let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
    let rdlength = usize::from(u16::from_be_bytes([fixed[8], fixed[9]]));
    let rdata_off = next + 10;
    let rdata = msg
        .get(rdata_off..rdata_off + rdlength)
        .ok_or_else(|| Error::Parse("truncated rdata".into()))?;

    let data = match rtype {
        RecordType::A if rdlength == 4 => {
            RData::A(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]))
        }
        RecordType::Aaaa if rdlength == 16 => {
            let octets: [u8; 16] = rdata.try_into().map_err(|_| Error::Parse("aaaa".into()))?;
            RData::Aaaa(Ipv6Addr::from(octets))
        }
        RecordType::Cname => {
            let (target, _) = decode_name(msg, rdata_off)?;
            RData::Cname(target)
        }
        _ => RData::Other(rdata.to_vec()),
    };
    Ok((
        Record {
            name,
            rtype,
            ttl,
            data,
        },
        rdata_off + rdlength,
    ))
}
