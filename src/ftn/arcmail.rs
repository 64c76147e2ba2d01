//! Arcmail bundles: ZIP archives whose entries are mail packets.
//!
//! Only the two mandatory ZIP methods appear on the wire: Store (0) and
//! DEFLATE (8). The writer emits DEFLATE entries with a standard central
//! directory; the reader walks the central directory so it tolerates
//! archives produced by other tossers. Bundle extensions cycle with the
//! day of week (`.mo0` … `.su9`) so several bundles to the same node on
//! the same day do not collide.

use std::io::{Read, Write};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use super::addr::FtnAddress;
use crate::transfer::crc::crc32;

const LOCAL_SIG: u32 = 0x0403_4b50;
const CENTRAL_SIG: u32 = 0x0201_4b50;
const EOCD_SIG: u32 = 0x0605_4b50;

const METHOD_STORE: u16 = 0;
const METHOD_DEFLATE: u16 = 8;

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn get_u16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

fn get_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

/// (dos_time, dos_date) for the archive timestamps.
fn dos_datetime(ts: DateTime<Utc>) -> (u16, u16) {
    let time = ((ts.hour() as u16) << 11) | ((ts.minute() as u16) << 5) | (ts.second() as u16 / 2);
    let year = (ts.year().clamp(1980, 2107) - 1980) as u16;
    let date = (year << 9) | ((ts.month() as u16) << 5) | ts.day() as u16;
    (time, date)
}

/// Build a ZIP archive from `(name, bytes)` entries using DEFLATE.
pub fn zip_create(entries: &[(String, Vec<u8>)], ts: DateTime<Utc>) -> Result<Vec<u8>> {
    let (dos_time, dos_date) = dos_datetime(ts);
    let mut out = Vec::new();
    let mut central = Vec::new();
    let mut count = 0u16;

    for (name, data) in entries {
        let offset = out.len() as u32;
        let crc = crc32(data);
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data)?;
        let compressed = enc.finish()?;
        // Fall back to Store when DEFLATE does not help.
        let (method, payload) = if compressed.len() < data.len() {
            (METHOD_DEFLATE, compressed)
        } else {
            (METHOD_STORE, data.clone())
        };

        put_u32(&mut out, LOCAL_SIG);
        put_u16(&mut out, 20); // version needed
        put_u16(&mut out, 0); // flags
        put_u16(&mut out, method);
        put_u16(&mut out, dos_time);
        put_u16(&mut out, dos_date);
        put_u32(&mut out, crc);
        put_u32(&mut out, payload.len() as u32);
        put_u32(&mut out, data.len() as u32);
        put_u16(&mut out, name.len() as u16);
        put_u16(&mut out, 0); // extra length
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&payload);

        put_u32(&mut central, CENTRAL_SIG);
        put_u16(&mut central, 20); // version made by
        put_u16(&mut central, 20); // version needed
        put_u16(&mut central, 0);
        put_u16(&mut central, method);
        put_u16(&mut central, dos_time);
        put_u16(&mut central, dos_date);
        put_u32(&mut central, crc);
        put_u32(&mut central, payload.len() as u32);
        put_u32(&mut central, data.len() as u32);
        put_u16(&mut central, name.len() as u16);
        put_u16(&mut central, 0); // extra
        put_u16(&mut central, 0); // comment
        put_u16(&mut central, 0); // disk
        put_u16(&mut central, 0); // internal attrs
        put_u32(&mut central, 0); // external attrs
        put_u32(&mut central, offset);
        central.extend_from_slice(name.as_bytes());
        count += 1;
    }

    let cd_offset = out.len() as u32;
    out.extend_from_slice(&central);
    put_u32(&mut out, EOCD_SIG);
    put_u16(&mut out, 0); // disk
    put_u16(&mut out, 0); // cd disk
    put_u16(&mut out, count);
    put_u16(&mut out, count);
    put_u32(&mut out, central.len() as u32);
    put_u32(&mut out, cd_offset);
    put_u16(&mut out, 0); // comment
    Ok(out)
}

/// Extract every entry of a ZIP archive via its central directory.
/// Entries with a CRC mismatch or an unsupported method are errors; the
/// caller quarantines the whole bundle.
pub fn zip_extract(data: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    let eocd = find_eocd(data).ok_or_else(|| anyhow!("no ZIP end-of-directory marker"))?;
    let count = get_u16(data, eocd + 10) as usize;
    let mut pos = get_u32(data, eocd + 16) as usize;
    let mut out = Vec::with_capacity(count);

    for _ in 0..count {
        if pos + 46 > data.len() || get_u32(data, pos) != CENTRAL_SIG {
            return Err(anyhow!("corrupt ZIP central directory"));
        }
        let method = get_u16(data, pos + 10);
        let crc_expected = get_u32(data, pos + 16);
        let csize = get_u32(data, pos + 20) as usize;
        let usize_ = get_u32(data, pos + 24) as usize;
        let name_len = get_u16(data, pos + 28) as usize;
        let extra_len = get_u16(data, pos + 30) as usize;
        let comment_len = get_u16(data, pos + 32) as usize;
        let local_off = get_u32(data, pos + 42) as usize;
        let name = String::from_utf8_lossy(&data[pos + 46..pos + 46 + name_len]).into_owned();
        pos += 46 + name_len + extra_len + comment_len;

        if local_off + 30 > data.len() || get_u32(data, local_off) != LOCAL_SIG {
            return Err(anyhow!("corrupt ZIP local header for '{}'", name));
        }
        let l_name = get_u16(data, local_off + 26) as usize;
        let l_extra = get_u16(data, local_off + 28) as usize;
        let data_start = local_off + 30 + l_name + l_extra;
        if data_start + csize > data.len() {
            return Err(anyhow!("truncated ZIP entry '{}'", name));
        }
        let raw = &data[data_start..data_start + csize];
        let bytes = match method {
            METHOD_STORE => raw.to_vec(),
            METHOD_DEFLATE => {
                let mut decoder = DeflateDecoder::new(raw);
                let mut buf = Vec::with_capacity(usize_);
                decoder
                    .read_to_end(&mut buf)
                    .map_err(|e| anyhow!("inflate failed for '{}': {}", name, e))?;
                buf
            }
            m => return Err(anyhow!("unsupported ZIP method {} for '{}'", m, name)),
        };
        if crc32(&bytes) != crc_expected {
            return Err(anyhow!("CRC mismatch in ZIP entry '{}'", name));
        }
        out.push((name, bytes));
    }
    Ok(out)
}

fn find_eocd(data: &[u8]) -> Option<usize> {
    if data.len() < 22 {
        return None;
    }
    let floor = data.len().saturating_sub(22 + 65_536);
    (floor..=data.len() - 22)
        .rev()
        .find(|&i| get_u32(data, i) == EOCD_SIG)
}

// ---------------------------------------------------------------------------
// Bundle naming
// ---------------------------------------------------------------------------

const DOW_PREFIX: [&str; 7] = ["su", "mo", "tu", "we", "th", "fr", "sa"];

/// Extension for a bundle produced now, e.g. `mo3`.
pub fn arcmail_extension(ts: DateTime<Utc>) -> String {
    let dow = DOW_PREFIX[ts.weekday().num_days_from_sunday() as usize];
    format!("{}{}", dow, ts.day() % 10)
}

/// Whether a filename looks like an inbound arcmail bundle (`*.mo0`…`su9`
/// or `*.zip`).
pub fn is_arcmail_name(name: &str) -> bool {
    let ext = match name.rsplit_once('.') {
        Some((_, e)) => e.to_ascii_lowercase(),
        None => return false,
    };
    if ext == "zip" {
        return true;
    }
    ext.len() == 3
        && DOW_PREFIX.contains(&&ext[..2])
        && ext.as_bytes()[2].is_ascii_digit()
}

/// Bundle base name for a destination, the traditional hex net/node pair.
pub fn bundle_name(dest: &FtnAddress, ts: DateTime<Utc>) -> String {
    format!("{:04x}{:04x}.{}", dest.net, dest.node, arcmail_extension(ts))
}

/// Whether a filename looks like a loose mail packet.
pub fn is_packet_name(name: &str) -> bool {
    name.rsplit_once('.')
        .map(|(_, e)| e.eq_ignore_ascii_case("pkt"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn zip_round_trip_deflate() {
        let ts = Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap();
        let text = "the same phrase again and again and again ".repeat(50);
        let entries = vec![
            ("0001.pkt".to_string(), text.clone().into_bytes()),
            ("0002.pkt".to_string(), vec![0xA5u8; 300]),
        ];
        let archive = zip_create(&entries, ts).unwrap();
        // Compressible input actually compressed.
        assert!(archive.len() < text.len());
        let back = zip_extract(&archive).unwrap();
        assert_eq!(back, entries);
    }

    #[test]
    fn incompressible_entry_falls_back_to_store() {
        let ts = Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap();
        // A short pseudo-random blob that DEFLATE cannot shrink.
        let blob: Vec<u8> = (0u32..64)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();
        let entries = vec![("rand.pkt".to_string(), blob)];
        let archive = zip_create(&entries, ts).unwrap();
        assert_eq!(zip_extract(&archive).unwrap(), entries);
    }

    #[test]
    fn corrupt_archive_is_rejected() {
        let ts = Utc::now();
        let entries = vec![("a.pkt".to_string(), b"payload data here".to_vec())];
        let mut archive = zip_create(&entries, ts).unwrap();
        // Flip a payload byte; CRC check must catch it.
        archive[35] ^= 0xFF;
        assert!(zip_extract(&archive).is_err());
        assert!(zip_extract(b"not a zip at all").is_err());
    }

    #[test]
    fn day_cycle_extensions() {
        let monday = Utc.with_ymd_and_hms(2025, 6, 2, 1, 0, 0).unwrap();
        assert_eq!(arcmail_extension(monday), "mo2");
        let sunday = Utc.with_ymd_and_hms(2025, 6, 8, 1, 0, 0).unwrap();
        assert_eq!(arcmail_extension(sunday), "su8");

        assert!(is_arcmail_name("00fa0006.mo2"));
        assert!(is_arcmail_name("bundle.ZIP"));
        assert!(is_arcmail_name("00fa0006.su9"));
        assert!(!is_arcmail_name("00fa0006.pkt"));
        assert!(!is_arcmail_name("readme.txt"));
        assert!(!is_arcmail_name("noext"));

        let addr: FtnAddress = "2:250/6".parse().unwrap();
        assert_eq!(bundle_name(&addr, monday), "00fa0006.mo2");
    }

    #[test]
    fn packet_names() {
        assert!(is_packet_name("1a2b3c4d.pkt"));
        assert!(is_packet_name("1A2B3C4D.PKT"));
        assert!(!is_packet_name("1a2b3c4d.mo0"));
    }
}
