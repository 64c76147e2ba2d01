//! FTN type 2+ packet and packed-message codec.
//!
//! The 58-byte packet header follows the published type 2+ layout: the
//! capability word is 0x0001 with its byte-swapped validation copy 0x0100,
//! zones appear both in the QM slots and the type-2+ slots, and the
//! product-specific trailer closes the header. Messages inside the packet
//! carry the 14-byte fixed header, the NUL-terminated date/to/from/subject
//! strings, and a NUL-terminated body. A zero type word terminates the
//! packet.
//!
//! Body kludge lines start with SOH (0x01): `AREA:`, `MSGID:`, `REPLY:`,
//! `PATH:`, `SEEN-BY:`, `INTL`, `FMPT`, `TOPT`.

use chrono::{DateTime, Datelike, Timelike, Utc};
use thiserror::Error;

use super::addr::FtnAddress;

pub const PACKET_TYPE: u16 = 2;
pub const CAPABILITY_WORD: u16 = 0x0001;
const HEADER_LEN: usize = 58;

/// Product code we stamp into generated packets.
pub const PRODUCT_CODE: u16 = 0x1EFE;
pub const REVISION: (u8, u8) = (0, 4);

pub const SOH: u8 = 0x01;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short")]
    Truncated,
    #[error("bad packet magic (type word {0})")]
    BadMagic(u16),
    #[error("malformed packed message")]
    BadMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub orig: FtnAddress,
    pub dest: FtnAddress,
    pub created: DateTime<Utc>,
    pub baud: u16,
    pub password: String,
    pub product_code: u16,
    pub revision: (u8, u8),
    pub prod_data: u32,
}

impl PacketHeader {
    pub fn new(orig: FtnAddress, dest: FtnAddress, password: &str, created: DateTime<Utc>) -> Self {
        PacketHeader {
            orig,
            dest,
            created,
            baud: 0,
            password: password.to_string(),
            product_code: PRODUCT_CODE,
            revision: REVISION,
            prod_data: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedMessage {
    pub orig: FtnAddress,
    pub dest: FtnAddress,
    pub attributes: u16,
    pub cost: u16,
    /// `DD MMM YY  HH:MM:SS`
    pub datetime: String,
    pub to: String,
    pub from: String,
    pub subject: String,
    pub body: Vec<u8>,
}

pub fn format_datetime(ts: DateTime<Utc>) -> String {
    ts.format("%d %b %y  %H:%M:%S").to_string()
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn get_u16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

/// Encode the 58-byte packet header.
pub fn encode_header(h: &PacketHeader) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN);
    put_u16(&mut out, h.orig.node);
    put_u16(&mut out, h.dest.node);
    put_u16(&mut out, h.created.year() as u16);
    put_u16(&mut out, h.created.month0() as u16);
    put_u16(&mut out, h.created.day() as u16);
    put_u16(&mut out, h.created.hour() as u16);
    put_u16(&mut out, h.created.minute() as u16);
    put_u16(&mut out, h.created.second() as u16);
    put_u16(&mut out, h.baud);
    put_u16(&mut out, PACKET_TYPE);
    put_u16(&mut out, h.orig.net);
    put_u16(&mut out, h.dest.net);
    out.push((h.product_code & 0xFF) as u8);
    out.push(h.revision.0);
    let mut pw = [0u8; 8];
    for (i, b) in h.password.bytes().take(8).enumerate() {
        pw[i] = b;
    }
    out.extend_from_slice(&pw);
    put_u16(&mut out, h.orig.zone); // QM origin zone
    put_u16(&mut out, h.dest.zone); // QM destination zone
    put_u16(&mut out, 0); // aux net
    put_u16(&mut out, CAPABILITY_WORD.swap_bytes()); // validation copy, 0x0100
    out.push((h.product_code >> 8) as u8);
    out.push(h.revision.1);
    put_u16(&mut out, CAPABILITY_WORD);
    put_u16(&mut out, h.orig.zone);
    put_u16(&mut out, h.dest.zone);
    put_u16(&mut out, h.orig.point);
    put_u16(&mut out, h.dest.point);
    out.extend_from_slice(&h.prod_data.to_le_bytes());
    debug_assert_eq!(out.len(), HEADER_LEN);
    out
}

/// Decode a packet header, rejecting anything whose type word is not 2.
pub fn decode_header(data: &[u8]) -> Result<PacketHeader, PacketError> {
    if data.len() < HEADER_LEN {
        return Err(PacketError::Truncated);
    }
    let typ = get_u16(data, 18);
    if typ != PACKET_TYPE {
        return Err(PacketError::BadMagic(typ));
    }
    let password = data[26..34]
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect();
    let orig = FtnAddress {
        zone: get_u16(data, 46),
        net: get_u16(data, 20),
        node: get_u16(data, 0),
        point: get_u16(data, 50),
        domain: String::new(),
    };
    let dest = FtnAddress {
        zone: get_u16(data, 48),
        net: get_u16(data, 22),
        node: get_u16(data, 2),
        point: get_u16(data, 52),
        domain: String::new(),
    };
    let created = chrono::NaiveDate::from_ymd_opt(
        get_u16(data, 4) as i32,
        get_u16(data, 6) as u32 + 1,
        get_u16(data, 8).max(1) as u32,
    )
    .and_then(|d| {
        d.and_hms_opt(
            (get_u16(data, 10) as u32).min(23),
            (get_u16(data, 12) as u32).min(59),
            (get_u16(data, 14) as u32).min(59),
        )
    })
    .map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc))
    .unwrap_or_else(Utc::now);
    Ok(PacketHeader {
        orig,
        dest,
        created,
        baud: get_u16(data, 16),
        password,
        product_code: (data[42] as u16) << 8 | data[24] as u16,
        revision: (data[25], data[43]),
        prod_data: u32::from_le_bytes([data[54], data[55], data[56], data[57]]),
    })
}

fn put_cstr(out: &mut Vec<u8>, s: &str, max: usize) {
    let bytes = s.as_bytes();
    let take = bytes.len().min(max - 1);
    out.extend_from_slice(&bytes[..take]);
    out.push(0);
}

fn encode_message(out: &mut Vec<u8>, m: &PackedMessage) {
    put_u16(out, PACKET_TYPE);
    put_u16(out, m.orig.node);
    put_u16(out, m.dest.node);
    put_u16(out, m.orig.net);
    put_u16(out, m.dest.net);
    put_u16(out, m.attributes);
    put_u16(out, m.cost);
    put_cstr(out, &m.datetime, 20);
    put_cstr(out, &m.to, 36);
    put_cstr(out, &m.from, 36);
    put_cstr(out, &m.subject, 72);
    out.extend_from_slice(&m.body);
    out.push(0);
}

/// Encode a whole packet: header, messages, terminating zero word.
pub fn encode_packet(header: &PacketHeader, messages: &[PackedMessage]) -> Vec<u8> {
    let mut out = encode_header(header);
    for m in messages {
        encode_message(&mut out, m);
    }
    put_u16(&mut out, 0);
    out
}

fn read_cstr(data: &[u8], pos: &mut usize) -> Result<String, PacketError> {
    let start = *pos;
    let end = data[start..]
        .iter()
        .position(|&b| b == 0)
        .ok_or(PacketError::BadMessage)?
        + start;
    *pos = end + 1;
    Ok(String::from_utf8_lossy(&data[start..end]).into_owned())
}

/// Decode a whole packet into its header and messages.
pub fn decode_packet(data: &[u8]) -> Result<(PacketHeader, Vec<PackedMessage>), PacketError> {
    let header = decode_header(data)?;
    let mut messages = Vec::new();
    let mut pos = HEADER_LEN;
    loop {
        if pos + 2 > data.len() {
            // Missing terminator; accept what we have.
            break;
        }
        let typ = get_u16(data, pos);
        if typ == 0 {
            break;
        }
        if typ != PACKET_TYPE {
            return Err(PacketError::BadMessage);
        }
        if pos + 14 > data.len() {
            return Err(PacketError::Truncated);
        }
        let orig_node = get_u16(data, pos + 2);
        let dest_node = get_u16(data, pos + 4);
        let orig_net = get_u16(data, pos + 6);
        let dest_net = get_u16(data, pos + 8);
        let attributes = get_u16(data, pos + 10);
        let cost = get_u16(data, pos + 12);
        pos += 14;
        let datetime = read_cstr(data, &mut pos)?;
        let to = read_cstr(data, &mut pos)?;
        let from = read_cstr(data, &mut pos)?;
        let subject = read_cstr(data, &mut pos)?;
        let body_start = pos;
        let body_end = data[pos..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(PacketError::BadMessage)?
            + pos;
        pos = body_end + 1;
        // Zones travel in the INTL kludge when present; net/node always
        // come from the fixed header.
        let body = data[body_start..body_end].to_vec();
        let (mut orig, mut dest) = (
            FtnAddress::new(0, orig_net, orig_node, 0),
            FtnAddress::new(0, dest_net, dest_node, 0),
        );
        if let Some((intl_dest, intl_orig)) = parse_intl(&body) {
            orig.zone = intl_orig.zone;
            dest.zone = intl_dest.zone;
        }
        if let Some(p) = kludge_value(&body, "FMPT") {
            orig.point = p.trim().parse().unwrap_or(0);
        }
        if let Some(p) = kludge_value(&body, "TOPT") {
            dest.point = p.trim().parse().unwrap_or(0);
        }
        messages.push(PackedMessage {
            orig,
            dest,
            attributes,
            cost,
            datetime,
            to,
            from,
            subject,
            body,
        });
    }
    Ok((header, messages))
}

// ---------------------------------------------------------------------------
// Kludge parsing
// ---------------------------------------------------------------------------

/// Iterate the body's kludge lines as `(name, value)` pairs. Lines start
/// with SOH and end at CR; the name runs to the first `:` or space.
pub fn kludges(body: &[u8]) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < body.len() {
        if body[i] == SOH {
            let end = body[i + 1..]
                .iter()
                .position(|&b| b == b'\r' || b == b'\n')
                .map(|p| i + 1 + p)
                .unwrap_or(body.len());
            let line = String::from_utf8_lossy(&body[i + 1..end]);
            let (name, value) = match line.find([':', ' ']) {
                Some(sep) => (line[..sep].to_string(), line[sep + 1..].trim().to_string()),
                None => (line.trim().to_string(), String::new()),
            };
            out.push((name, value));
            i = end + 1;
        } else {
            // Skip to the next line.
            match body[i..].iter().position(|&b| b == b'\r' || b == b'\n') {
                Some(p) => i += p + 1,
                None => break,
            }
        }
    }
    out
}

pub fn kludge_value(body: &[u8], name: &str) -> Option<String> {
    kludges(body)
        .into_iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}

/// The echomail AREA tag, if any.
pub fn area_tag(body: &[u8]) -> Option<String> {
    kludge_value(body, "AREA").map(|v| v.to_ascii_uppercase())
}

pub fn msgid(body: &[u8]) -> Option<String> {
    kludge_value(body, "MSGID")
}

/// `INTL <dest> <orig>` addresses.
pub fn parse_intl(body: &[u8]) -> Option<(FtnAddress, FtnAddress)> {
    let v = kludge_value(body, "INTL")?;
    let mut parts = v.split_whitespace();
    let dest = parts.next()?.parse().ok()?;
    let orig = parts.next()?.parse().ok()?;
    Some((dest, orig))
}

/// Collect the 2D `net/node` entries from every SEEN-BY kludge line.
pub fn seen_by_entries(body: &[u8]) -> Vec<(u16, u16)> {
    let mut out = Vec::new();
    for (name, value) in kludges(body) {
        if !name.eq_ignore_ascii_case("SEEN-BY") {
            continue;
        }
        let mut net = 0u16;
        for token in value.split_whitespace() {
            if let Some((n, d)) = token.split_once('/') {
                net = n.parse().unwrap_or(0);
                if let Ok(node) = d.parse() {
                    out.push((net, node));
                }
            } else if let Ok(node) = token.parse() {
                // Bare node reuses the running net.
                out.push((net, node));
            }
        }
    }
    out
}

/// Append our address to the SEEN-BY and PATH kludges (echomail export).
pub fn append_seen_by_and_path(body: &mut Vec<u8>, aka: &FtnAddress) {
    let seen = format!("\x01SEEN-BY: {}/{}\r", aka.net, aka.node);
    let path = format!("\x01PATH: {}/{}\r", aka.net, aka.node);
    if !body.ends_with(b"\r") && !body.is_empty() {
        body.push(b'\r');
    }
    body.extend_from_slice(seen.as_bytes());
    body.extend_from_slice(path.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn addr(s: &str) -> FtnAddress {
        s.parse().unwrap()
    }

    fn sample_header() -> PacketHeader {
        PacketHeader::new(
            addr("2:250/6"),
            addr("2:250/0"),
            "SESAME",
            Utc.with_ymd_and_hms(2025, 11, 3, 21, 15, 42).unwrap(),
        )
    }

    #[test]
    fn header_is_58_bytes_and_round_trips() {
        let h = sample_header();
        let wire = encode_header(&h);
        assert_eq!(wire.len(), 58);
        // Type word at offset 18, capability validation copy at 40.
        assert_eq!(u16::from_le_bytes([wire[18], wire[19]]), 2);
        assert_eq!(u16::from_le_bytes([wire[40], wire[41]]), 0x0100);
        assert_eq!(u16::from_le_bytes([wire[44], wire[45]]), 0x0001);

        let back = decode_header(&wire).unwrap();
        assert_eq!(back.orig, h.orig.clone().with_domain(""));
        assert_eq!(back.dest.to_string(), "2:250/0");
        assert_eq!(back.password, "SESAME");
        assert_eq!(back.created, h.created);
        assert_eq!(back.product_code, PRODUCT_CODE);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut wire = encode_header(&sample_header());
        wire[18] = 9;
        assert_eq!(decode_header(&wire), Err(PacketError::BadMagic(9)));
        assert_eq!(decode_header(&wire[..30]), Err(PacketError::Truncated));
    }

    #[test]
    fn packet_round_trips_messages_byte_for_byte() {
        let h = sample_header();
        let body = b"\x01AREA:TEST\r\x01MSGID: 2:250/6 deadbeef\rHello there\r--- fidobbs\r".to_vec();
        let msg = PackedMessage {
            orig: addr("2:250/6"),
            dest: addr("2:250/0"),
            attributes: 0,
            cost: 0,
            datetime: format_datetime(h.created),
            to: "All".into(),
            from: "Alice".into(),
            subject: "test post".into(),
            body: body.clone(),
        };
        let wire = encode_packet(&h, &[msg.clone()]);
        let (header, messages) = decode_packet(&wire).unwrap();
        assert_eq!(header.password, "SESAME");
        assert_eq!(messages.len(), 1);
        let got = &messages[0];
        assert_eq!(got.to, "All");
        assert_eq!(got.from, "Alice");
        assert_eq!(got.subject, "test post");
        assert_eq!(got.body, body);
        assert_eq!((got.orig.net, got.orig.node), (250, 6));
    }

    #[test]
    fn intl_kludge_restores_zones() {
        let h = sample_header();
        let body = b"\x01INTL 1:10/1 2:250/6\rnetmail text\r".to_vec();
        let msg = PackedMessage {
            orig: addr("2:250/6"),
            dest: addr("1:10/1"),
            attributes: 0x0001,
            cost: 0,
            datetime: format_datetime(h.created),
            to: "Bob".into(),
            from: "Alice".into(),
            subject: "hi".into(),
            body,
        };
        let wire = encode_packet(&h, &[msg]);
        let (_, messages) = decode_packet(&wire).unwrap();
        assert_eq!(messages[0].dest.zone, 1);
        assert_eq!(messages[0].orig.zone, 2);
    }

    #[test]
    fn kludge_extraction() {
        let body = b"\x01AREA:R50.SYSOP\r\x01MSGID: 2:250/6 cafe01\rtext line\r\x01SEEN-BY: 250/0 6 99 5020/1042\r";
        assert_eq!(area_tag(body).as_deref(), Some("R50.SYSOP"));
        assert_eq!(msgid(body).as_deref(), Some("2:250/6 cafe01"));
        assert_eq!(
            seen_by_entries(body),
            vec![(250, 0), (250, 6), (250, 99), (5020, 1042)]
        );
    }

    #[test]
    fn seen_by_append() {
        let mut body = b"\x01AREA:TEST\rbody\r".to_vec();
        append_seen_by_and_path(&mut body, &addr("2:250/6"));
        let entries = seen_by_entries(&body);
        assert!(entries.contains(&(250, 6)));
        assert!(kludge_value(&body, "PATH").is_some());
    }

    #[test]
    fn empty_packet_is_just_header_and_terminator() {
        let wire = encode_packet(&sample_header(), &[]);
        assert_eq!(wire.len(), 60);
        let (_, messages) = decode_packet(&wire).unwrap();
        assert!(messages.is_empty());
    }
}
