//! Checksum and CRC primitives shared by the transfer protocols and the
//! FTN file-echo code.
//!
//! - CRC-16 is the XMODEM/YMODEM variant: CCITT polynomial 0x1021,
//!   initial value 0, transmitted big-endian.
//! - CRC-32 is the reflected 0xEDB88320 polynomial with init/final
//!   0xFFFFFFFF, as used by ZMODEM, ZIP, and TIC.

use crc::{Crc, CRC_16_XMODEM};

static CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

pub fn crc16_ccitt(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Incremental CRC-16 for streamed subpacket decoding.
pub struct Crc16 {
    digest: crc::Digest<'static, u16>,
}

impl Default for Crc16 {
    fn default() -> Self {
        Crc16 { digest: CRC16.digest() }
    }
}

impl Crc16 {
    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    pub fn finalize(self) -> u16 {
        self.digest.finalize()
    }
}

pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Incremental CRC-32 (reflected) wrapper.
#[derive(Default)]
pub struct Crc32 {
    hasher: crc32fast::Hasher,
}

impl Crc32 {
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> u32 {
        self.hasher.finalize()
    }
}

/// XMODEM checksum mode: plain mod-256 sum of the data bytes.
pub fn checksum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_known_vector() {
        // "123456789" under CRC-16/XMODEM
        assert_eq!(crc16_ccitt(b"123456789"), 0x31C3);
        assert_eq!(crc16_ccitt(b""), 0x0000);
    }

    #[test]
    fn crc16_xmodem_block_vector() {
        // The padded first block of "hello world\n" as transmitted by an
        // XMODEM-CRC sender.
        let mut block = Vec::from(&b"hello world\n"[..]);
        block.resize(128, 0x1A);
        assert_eq!(crc16_ccitt(&block), 0x0D79);
    }

    #[test]
    fn crc32_known_vector() {
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn incremental_matches_oneshot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut c16 = Crc16::default();
        c16.update(&data[..10]);
        c16.update(&data[10..]);
        assert_eq!(c16.finalize(), crc16_ccitt(data));

        let mut c32 = Crc32::default();
        c32.update(&data[..7]);
        c32.update(&data[7..]);
        assert_eq!(c32.finalize(), crc32(data));
    }

    #[test]
    fn checksum_wraps() {
        assert_eq!(checksum8(&[0xFF, 0x02]), 0x01);
    }
}
