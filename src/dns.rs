//! DNS message parsing and construction.
//!
//! Only what the cache needs: the question of a query, the answer section of
//! an upstream reply, and re-encoding cached answers against a new query.

use std::fmt::Write;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const HEADER_LEN: usize = 12;

/// Maximum compression pointers followed while reading one name.
const MAX_POINTER_HOPS: usize = 32;

const FLAG_QR: u16 = 0x8000;
const FLAG_TC: u16 = 0x0200;
const FLAG_RA: u16 = 0x0080;
/// Opcode and RD bits, echoed from the query.
const ECHOED_FLAGS: u16 = 0x7900;

pub const TYPE_A: u16 = 1;
pub const TYPE_NS: u16 = 2;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_SOA: u16 = 6;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_MX: u16 = 15;
pub const TYPE_TXT: u16 = 16;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_SRV: u16 = 33;
pub const TYPE_HTTPS: u16 = 65;

pub const CLASS_IN: u16 = 1;

/// A parsed DNS query.
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub id: u16,
    pub flags: u16,
    /// Question name as sent, case preserved. Bytes outside printable ASCII
    /// are written as `\DDD`.
    pub domain: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl DnsQuery {
    /// Parse the header and first question of a DNS query.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN + 1 {
            return Err(Error::Malformed("shorter than a DNS header"));
        }

        let id = read_u16(data, 0)?;
        let flags = read_u16(data, 2)?;
        if flags & FLAG_QR != 0 {
            return Err(Error::Malformed("not a query"));
        }
        if read_u16(data, 4)? == 0 {
            return Err(Error::Malformed("no question"));
        }

        let (question, _) = read_question(data, HEADER_LEN)?;

        Ok(Self {
            id,
            flags,
            domain: question.domain,
            qtype: question.qtype,
            qclass: question.qclass,
        })
    }

    /// Whether `reply` answers this query: a response with the same id whose
    /// first question has the same name, type and class.
    pub fn matches_reply(&self, reply: &[u8]) -> bool {
        let (Ok(id), Ok(flags), Ok(qdcount)) =
            (read_u16(reply, 0), read_u16(reply, 2), read_u16(reply, 4))
        else {
            return false;
        };
        if id != self.id || flags & FLAG_QR == 0 || qdcount == 0 {
            return false;
        }

        match read_question(reply, HEADER_LEN) {
            Ok((question, _)) => {
                question.qtype == self.qtype
                    && question.qclass == self.qclass
                    && question.domain.eq_ignore_ascii_case(&self.domain)
            }
            Err(_) => false,
        }
    }

    /// Build a response to this query by replaying cached records.
    ///
    /// Every record is written with the cached `ttl`, in the order given.
    pub fn response_from_records(&self, ttl: u32, records: &[CachedRecord]) -> Vec<u8> {
        DnsResponse {
            id: self.id,
            flags: FLAG_QR | FLAG_RA | (self.flags & ECHOED_FLAGS),
            questions: vec![DnsQuestion {
                domain: self.domain.clone(),
                qtype: self.qtype,
                qclass: self.qclass,
            }],
            answers: records
                .iter()
                .map(|record| DnsRecord {
                    name: record.name.clone(),
                    rtype: record.rtype,
                    class: record.class,
                    ttl,
                    rdata: record.rdata.clone(),
                })
                .collect(),
        }
        .to_bytes()
    }
}

/// One answer record as kept in the cache.
///
/// Names inside `rdata` are stored uncompressed so the record can be written
/// into any message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedRecord {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub rdata: Vec<u8>,
}

/// The answer section of an upstream reply.
#[derive(Debug, Clone)]
pub struct Answer {
    /// First question of the reply, if it carried one.
    pub question: Option<DnsQuestion>,
    /// TC bit: the upstream cut the message short.
    pub truncated: bool,
    /// TTL of the first answer record, or 0 when there are none.
    pub ttl: u32,
    pub records: Vec<CachedRecord>,
}

/// Decode the answer section of a DNS response.
pub fn parse_answer(data: &[u8]) -> Result<Answer> {
    if data.len() < HEADER_LEN {
        return Err(Error::Malformed("shorter than a DNS header"));
    }
    let flags = read_u16(data, 2)?;
    if flags & FLAG_QR == 0 {
        return Err(Error::Malformed("not a response"));
    }

    let qdcount = read_u16(data, 4)?;
    let ancount = read_u16(data, 6)?;

    let mut pos = HEADER_LEN;
    let mut question = None;
    for _ in 0..qdcount {
        let (parsed, next) = read_question(data, pos)?;
        question.get_or_insert(parsed);
        pos = next;
    }

    let mut ttl = None;
    let mut records = Vec::with_capacity(ancount as usize);

    for _ in 0..ancount {
        let (name, next) = read_name(data, pos)?;
        let rtype = read_u16(data, next)?;
        let class = read_u16(data, next + 2)?;
        let record_ttl = read_u32(data, next + 4)?;
        let rdlength = read_u16(data, next + 8)? as usize;
        let start = next + 10;
        if start + rdlength > data.len() {
            return Err(Error::Malformed("truncated rdata"));
        }

        ttl.get_or_insert(record_ttl);
        records.push(CachedRecord {
            name,
            rtype,
            class,
            rdata: expand_rdata(data, rtype, start, rdlength)?,
        });
        pos = start + rdlength;
    }

    Ok(Answer {
        question,
        truncated: flags & FLAG_TC != 0,
        ttl: ttl.unwrap_or(0),
        records,
    })
}

/// Copy rdata out of a message, decompressing embedded names.
fn expand_rdata(data: &[u8], rtype: u16, start: usize, len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(len);
    match rtype {
        TYPE_NS | TYPE_CNAME | TYPE_PTR => {
            let (name, _) = read_name(data, start)?;
            encode_domain(&mut out, &name);
        }
        TYPE_MX => {
            out.extend_from_slice(&read_u16(data, start)?.to_be_bytes());
            let (exchange, _) = read_name(data, start + 2)?;
            encode_domain(&mut out, &exchange);
        }
        TYPE_SOA => {
            let (mname, next) = read_name(data, start)?;
            let (rname, next) = read_name(data, next)?;
            let counters = data
                .get(next..next + 20)
                .ok_or(Error::Malformed("truncated SOA"))?;
            encode_domain(&mut out, &mname);
            encode_domain(&mut out, &rname);
            out.extend_from_slice(counters);
        }
        _ => out.extend_from_slice(&data[start..start + len]),
    }
    Ok(out)
}

/// A DNS response.
#[derive(Debug, Clone)]
pub struct DnsResponse {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
}

/// A DNS question section entry.
#[derive(Debug, Clone)]
pub struct DnsQuestion {
    pub domain: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// A DNS resource record.
#[derive(Debug, Clone)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl DnsResponse {
    /// Encode the response to wire format bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(512);

        // Header
        data.extend_from_slice(&self.id.to_be_bytes());
        data.extend_from_slice(&self.flags.to_be_bytes());
        data.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
        data.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        data.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
        data.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

        for q in &self.questions {
            encode_domain(&mut data, &q.domain);
            data.extend_from_slice(&q.qtype.to_be_bytes());
            data.extend_from_slice(&q.qclass.to_be_bytes());
        }

        for a in &self.answers {
            // Pointer to the first question's name at offset 12
            if !self.questions.is_empty() && a.name == self.questions[0].domain {
                data.extend_from_slice(&[0xC0, 0x0C]);
            } else {
                encode_domain(&mut data, &a.name);
            }
            data.extend_from_slice(&a.rtype.to_be_bytes());
            data.extend_from_slice(&a.class.to_be_bytes());
            data.extend_from_slice(&a.ttl.to_be_bytes());
            data.extend_from_slice(&(a.rdata.len() as u16).to_be_bytes());
            data.extend_from_slice(&a.rdata);
        }

        data
    }
}

/// Write a dotted name as uncompressed labels. `"."` is the root.
///
/// `\DDD` and `\X` escapes inside a label are decoded to single bytes.
pub fn encode_domain(buf: &mut Vec<u8>, domain: &str) {
    for label in domain.split('.').filter(|label| !label.is_empty()) {
        let bytes = unescape_label(label);
        buf.push(bytes.len() as u8);
        buf.extend_from_slice(&bytes);
    }
    buf.push(0);
}

/// Presentation form of a wire label. Case is kept.
fn escape_label(label: &[u8]) -> String {
    let mut out = String::with_capacity(label.len());
    for &byte in label {
        match byte {
            0x21..=0x7E if byte != b'.' && byte != b'\\' => out.push(byte as char),
            _ => {
                let _ = write!(out, "\\{:03}", byte);
            }
        }
    }
    out
}

fn unescape_label(label: &str) -> Vec<u8> {
    let raw = label.as_bytes();
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;

    while i < raw.len() {
        if raw[i] == b'\\' {
            let decimal = raw
                .get(i + 1..i + 4)
                .filter(|digits| digits.iter().all(u8::is_ascii_digit))
                .map(|digits| {
                    digits
                        .iter()
                        .fold(0u16, |acc, &d| acc * 10 + u16::from(d - b'0'))
                })
                .and_then(|value| u8::try_from(value).ok());
            if let Some(byte) = decimal {
                out.push(byte);
                i += 4;
                continue;
            }
            if let Some(&next) = raw.get(i + 1) {
                out.push(next);
                i += 2;
                continue;
            }
        }
        out.push(raw[i]);
        i += 1;
    }

    out
}

fn read_question(data: &[u8], pos: usize) -> Result<(DnsQuestion, usize)> {
    let (domain, next) = read_name(data, pos)?;
    let qtype = read_u16(data, next)?;
    let qclass = read_u16(data, next + 2)?;
    Ok((
        DnsQuestion {
            domain,
            qtype,
            qclass,
        },
        next + 4,
    ))
}

/// Read a possibly compressed name starting at `pos`.
///
/// Returns the dotted name in presentation form and the offset just past the
/// name where it starts (not past any pointer target).
fn read_name(data: &[u8], mut pos: usize) -> Result<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut end = None;
    let mut hops = 0;

    loop {
        let len = *data.get(pos).ok_or(Error::Malformed("truncated name"))? as usize;
        match len & 0xC0 {
            0x00 if len == 0 => {
                pos += 1;
                break;
            }
            0x00 => {
                let label = data
                    .get(pos + 1..pos + 1 + len)
                    .ok_or(Error::Malformed("truncated label"))?;
                labels.push(escape_label(label));
                pos += 1 + len;
            }
            0xC0 => {
                let low = *data.get(pos + 1).ok_or(Error::Malformed("truncated pointer"))?;
                end.get_or_insert(pos + 2);
                hops += 1;
                if hops > MAX_POINTER_HOPS {
                    return Err(Error::Malformed("compression loop"));
                }
                pos = ((len & 0x3F) << 8) | low as usize;
            }
            _ => return Err(Error::Malformed("unsupported label type")),
        }
    }

    let name = if labels.is_empty() {
        ".".to_string()
    } else {
        labels.join(".")
    };
    Ok((name, end.unwrap_or(pos)))
}

fn read_u16(data: &[u8], pos: usize) -> Result<u16> {
    data.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(Error::Malformed("truncated message"))
}

fn read_u32(data: &[u8], pos: usize) -> Result<u32> {
    data.get(pos..pos + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(Error::Malformed("truncated message"))
}

/// Human readable name for common query types, for logs.
pub fn qtype_name(qtype: u16) -> String {
    match qtype {
        TYPE_A => "A".to_string(),
        TYPE_NS => "NS".to_string(),
        TYPE_CNAME => "CNAME".to_string(),
        TYPE_SOA => "SOA".to_string(),
        TYPE_PTR => "PTR".to_string(),
        TYPE_MX => "MX".to_string(),
        TYPE_TXT => "TXT".to_string(),
        TYPE_AAAA => "AAAA".to_string(),
        TYPE_SRV => "SRV".to_string(),
        TYPE_HTTPS => "HTTPS".to_string(),
        other => format!("TYPE{}", other),
    }
}
