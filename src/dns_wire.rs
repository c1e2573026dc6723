//! DNS wire format for the ECH lookup
//!
//! Builds a single-question query and scans a response for the `ech`
//! SvcParam (key 5) of HTTPS records (type 65). Every read is bounds
//! checked: a malformed or truncated message yields [`DnsError::Truncated`].

use crate::error::DnsError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// HTTPS resource record type (RFC 9460)
pub const TYPE_HTTPS: u16 = 65;
/// Internet class
pub const CLASS_IN: u16 = 1;
/// SvcParamKey carrying the ECHConfigList
pub const SVC_PARAM_ECH: u16 = 5;

const HEADER_LEN: usize = 12;

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;

/// Build a query for `domain` with a fixed transaction ID and RD set.
///
/// Labels longer than 63 bytes or names longer than 255 bytes on the wire
/// are rejected with [`DnsError::InvalidName`].
pub fn build_query(domain: &str, record_type: u16) -> Result<Vec<u8>, DnsError> {
    let mut query = Vec::with_capacity(HEADER_LEN + domain.len() + 6);
    query.extend_from_slice(&[
        0x00, 0x01, // ID
        0x01, 0x00, // RD
        0x00, 0x01, // QDCOUNT
        0x00, 0x00, // ANCOUNT
        0x00, 0x00, // NSCOUNT
        0x00, 0x00, // ARCOUNT
    ]);
    for label in domain.split('.').filter(|label| !label.is_empty()) {
        if label.len() > MAX_LABEL_LEN {
            return Err(DnsError::InvalidName);
        }
        query.push(label.len() as u8);
        query.extend_from_slice(label.as_bytes());
    }
    query.push(0x00);
    if query.len() - HEADER_LEN > MAX_NAME_LEN {
        return Err(DnsError::InvalidName);
    }
    query.extend_from_slice(&record_type.to_be_bytes());
    query.extend_from_slice(&CLASS_IN.to_be_bytes());
    Ok(query)
}

/// Scan a DoH response for the first non-empty ECH parameter.
///
/// Returns the parameter base64-encoded (standard alphabet).
pub fn parse_response(response: &[u8]) -> Result<String, DnsError> {
    let message = DnsMessage::parse(response)?;
    if message.answer_count() == 0 {
        return Err(DnsError::NoAnswer);
    }

    for record in message.answers() {
        let record = record?;
        if record.rtype != TYPE_HTTPS {
            continue;
        }
        if let Some(ech) = parse_https_record(record.rdata) {
            return Ok(ech);
        }
    }

    Err(DnsError::NoEchParameter)
}

/// Extract the `ech` SvcParam from HTTPS record RDATA, base64-encoded.
///
/// Returns `None` when the record has no (or an empty) ECH parameter or
/// when its parameters overrun the RDATA.
pub fn parse_https_record(rdata: &[u8]) -> Option<String> {
    svc_param(rdata, SVC_PARAM_ECH).map(|value| STANDARD.encode(value))
}

fn svc_param(rdata: &[u8], wanted: u16) -> Option<&[u8]> {
    // SvcPriority
    if rdata.len() < 2 {
        return None;
    }
    // TargetName: root (single zero byte) or a label sequence
    let mut offset = skip_name(rdata, 2).ok()?;

    while offset + 4 <= rdata.len() {
        let key = u16::from_be_bytes([rdata[offset], rdata[offset + 1]]);
        let len = u16::from_be_bytes([rdata[offset + 2], rdata[offset + 3]]) as usize;
        offset += 4;
        let value = rdata.get(offset..offset + len)?;
        offset += len;
        if key == wanted {
            return (!value.is_empty()).then_some(value);
        }
    }

    None
}

/// Borrowed view over a DNS message: header counts plus a lazy answer scan.
#[derive(Debug, Clone, Copy)]
pub struct DnsMessage<'a> {
    buf: &'a [u8],
    id: u16,
    answer_count: u16,
    answers_offset: usize,
}

impl<'a> DnsMessage<'a> {
    /// Validate the header and skip the question section.
    pub fn parse(buf: &'a [u8]) -> Result<Self, DnsError> {
        if buf.len() < HEADER_LEN {
            return Err(DnsError::Truncated);
        }
        let id = read_u16(buf, 0)?;
        let question_count = read_u16(buf, 4)?;
        let answer_count = read_u16(buf, 6)?;

        let mut offset = HEADER_LEN;
        for _ in 0..question_count {
            // QNAME, QTYPE, QCLASS
            offset = skip_name(buf, offset)? + 4;
            if offset > buf.len() {
                return Err(DnsError::Truncated);
            }
        }

        Ok(Self {
            buf,
            id,
            answer_count,
            answers_offset: offset,
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn answer_count(&self) -> u16 {
        self.answer_count
    }

    /// Iterate answer records. Stops after the first malformed record.
    pub fn answers(&self) -> Answers<'a> {
        Answers {
            buf: self.buf,
            offset: self.answers_offset,
            remaining: self.answer_count,
        }
    }
}

/// A resource record with its RDATA still borrowed from the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRecord<'a> {
    pub rtype: u16,
    pub rdata: &'a [u8],
}

/// Iterator over the answer section.
#[derive(Debug)]
pub struct Answers<'a> {
    buf: &'a [u8],
    offset: usize,
    remaining: u16,
}

impl<'a> Iterator for Answers<'a> {
    type Item = Result<ResourceRecord<'a>, DnsError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        match read_record(self.buf, self.offset) {
            Ok((record, next)) => {
                self.offset = next;
                Some(Ok(record))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}

fn read_record(buf: &[u8], offset: usize) -> Result<(ResourceRecord<'_>, usize), DnsError> {
    let offset = skip_name(buf, offset)?;
    let rtype = read_u16(buf, offset)?;
    // TYPE(2) CLASS(2) TTL(4) RDLENGTH(2)
    let rdlength = read_u16(buf, offset + 8)? as usize;
    let start = offset + 10;
    let rdata = buf
        .get(start..start + rdlength)
        .ok_or(DnsError::Truncated)?;
    Ok((ResourceRecord { rtype, rdata }, start + rdlength))
}

/// Skip an encoded name, returning the offset just past it.
///
/// A compression pointer ends the name after its two bytes; pointers are
/// never followed.
fn skip_name(buf: &[u8], mut offset: usize) -> Result<usize, DnsError> {
    loop {
        let len = *buf.get(offset).ok_or(DnsError::Truncated)?;
        if len == 0 {
            return Ok(offset + 1);
        }
        if len & 0xC0 == 0xC0 {
            if offset + 2 > buf.len() {
                return Err(DnsError::Truncated);
            }
            return Ok(offset + 2);
        }
        offset += 1 + len as usize;
    }
}

fn read_u16(buf: &[u8], offset: usize) -> Result<u16, DnsError> {
    buf.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(DnsError::Truncated)
}
