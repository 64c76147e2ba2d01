//! TIC companion files for file-echo distribution.
//!
//! Line-oriented `Key value` text with case-insensitive keys. The CRC key
//! is the 8-hex-digit CRC-32 of the companion file and must verify before
//! the file enters a file base.

use std::str::FromStr;

use anyhow::{anyhow, Result};

use super::addr::FtnAddress;
use crate::transfer::crc::crc32;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TicFile {
    pub file: String,
    pub area: String,
    pub desc: String,
    pub size: Option<u64>,
    pub crc: Option<u32>,
    pub origin: Option<FtnAddress>,
    pub from: Option<FtnAddress>,
    pub to: Option<FtnAddress>,
    pub password: String,
    pub release: String,
    pub magic: String,
    pub replaces: String,
    pub seenby: Vec<String>,
    pub path: Vec<String>,
}

impl TicFile {
    pub fn parse(text: &str) -> Result<TicFile> {
        let mut tic = TicFile::default();
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((k, v)) => (k, v.trim()),
                None => (line, ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "file" => tic.file = value.to_string(),
                "area" => tic.area = value.to_ascii_uppercase(),
                "desc" => {
                    if tic.desc.is_empty() {
                        tic.desc = value.to_string();
                    } else {
                        tic.desc.push(' ');
                        tic.desc.push_str(value);
                    }
                }
                "size" => tic.size = value.parse().ok(),
                "crc" => tic.crc = u32::from_str_radix(value, 16).ok(),
                "origin" => tic.origin = FtnAddress::from_str(value).ok(),
                "from" => tic.from = FtnAddress::from_str(value).ok(),
                "to" => tic.to = FtnAddress::from_str(value).ok(),
                "password" | "pw" => tic.password = value.to_string(),
                "release" => tic.release = value.to_string(),
                "magic" => tic.magic = value.to_string(),
                "replaces" => tic.replaces = value.to_string(),
                "seenby" => tic.seenby.push(value.to_string()),
                "path" => tic.path.push(value.to_string()),
                _ => {} // unknown keys pass through harmlessly
            }
        }
        if tic.file.is_empty() {
            return Err(anyhow!("TIC has no File key"));
        }
        if tic.area.is_empty() {
            return Err(anyhow!("TIC has no Area key"));
        }
        Ok(tic)
    }

    pub fn emit(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Area {}\r\n", self.area));
        out.push_str(&format!("File {}\r\n", self.file));
        if !self.desc.is_empty() {
            out.push_str(&format!("Desc {}\r\n", self.desc));
        }
        if let Some(size) = self.size {
            out.push_str(&format!("Size {}\r\n", size));
        }
        if let Some(crc) = self.crc {
            out.push_str(&format!("CRC {:08X}\r\n", crc));
        }
        if let Some(origin) = &self.origin {
            out.push_str(&format!("Origin {}\r\n", origin));
        }
        if let Some(from) = &self.from {
            out.push_str(&format!("From {}\r\n", from));
        }
        if let Some(to) = &self.to {
            out.push_str(&format!("To {}\r\n", to));
        }
        if !self.password.is_empty() {
            out.push_str(&format!("Password {}\r\n", self.password));
        }
        if !self.replaces.is_empty() {
            out.push_str(&format!("Replaces {}\r\n", self.replaces));
        }
        if !self.magic.is_empty() {
            out.push_str(&format!("Magic {}\r\n", self.magic));
        }
        for s in &self.seenby {
            out.push_str(&format!("Seenby {}\r\n", s));
        }
        for p in &self.path {
            out.push_str(&format!("Path {}\r\n", p));
        }
        out
    }

    /// CRC check against the companion file's bytes. A TIC without a CRC
    /// key never verifies.
    pub fn verify(&self, data: &[u8]) -> bool {
        self.crc.map(|c| c == crc32(data)).unwrap_or(false)
    }

    /// Derive the TIC we forward downstream: our AKA lands at the front of
    /// PATH and the end of SEENBY, and From/To are rewritten for the hop.
    pub fn forwarded(&self, our_aka: &FtnAddress, to: &FtnAddress) -> TicFile {
        let mut out = self.clone();
        out.from = Some(our_aka.clone());
        out.to = Some(to.clone());
        out.path.insert(0, our_aka.to_string());
        let aka_str = our_aka.to_string();
        if !out.seenby.iter().any(|s| s == &aka_str) {
            out.seenby.push(aka_str);
        }
        out.seenby.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Area UTILDISK\r
File archiver.zip\r
Desc A file archiver\r
Desc with a two-line description\r
Size 11\r
CRC 3B8119A1\r
Origin 2:250/99\r
From 2:250/0\r
To 2:250/6\r
Password SESAME\r
Seenby 2:250/0\r
Seenby 2:250/99\r
Path 2:250/99\r
Path 2:250/0\r
";

    #[test]
    fn parses_all_keys() {
        let tic = TicFile::parse(SAMPLE).unwrap();
        assert_eq!(tic.file, "archiver.zip");
        assert_eq!(tic.area, "UTILDISK");
        assert_eq!(tic.desc, "A file archiver with a two-line description");
        assert_eq!(tic.size, Some(11));
        assert_eq!(tic.crc, Some(0x3B8119A1));
        assert_eq!(tic.from.as_ref().unwrap().to_string(), "2:250/0");
        assert_eq!(tic.seenby.len(), 2);
        assert_eq!(tic.path.len(), 2);
        assert_eq!(tic.password, "SESAME");
    }

    #[test]
    fn keys_are_case_insensitive() {
        let tic = TicFile::parse("AREA x\nFILE y.zip\ncrc 0000000A\n").unwrap();
        assert_eq!(tic.area, "X");
        assert_eq!(tic.crc, Some(10));
    }

    #[test]
    fn missing_mandatory_keys_fail() {
        assert!(TicFile::parse("File x.zip\n").is_err());
        assert!(TicFile::parse("Area FOO\n").is_err());
    }

    #[test]
    fn crc_verification() {
        let payload = b"hello world";
        let mut tic = TicFile {
            file: "h.txt".into(),
            area: "T".into(),
            crc: Some(crate::transfer::crc::crc32(payload)),
            ..Default::default()
        };
        assert!(tic.verify(payload));
        assert!(!tic.verify(b"hello worle"));
        tic.crc = None;
        assert!(!tic.verify(payload));
    }

    #[test]
    fn emit_parse_round_trip() {
        let tic = TicFile::parse(SAMPLE).unwrap();
        let back = TicFile::parse(&tic.emit()).unwrap();
        assert_eq!(back, tic);
    }

    #[test]
    fn forwarding_updates_trail() {
        let tic = TicFile::parse(SAMPLE).unwrap();
        let aka: FtnAddress = "2:250/6".parse().unwrap();
        let dest: FtnAddress = "2:250/77".parse().unwrap();
        let fwd = tic.forwarded(&aka, &dest);
        assert_eq!(fwd.path.first().unwrap(), "2:250/6");
        assert!(fwd.seenby.contains(&"2:250/6".to_string()));
        assert_eq!(fwd.from.as_ref().unwrap(), &aka);
        assert_eq!(fwd.to.as_ref().unwrap(), &dest);
    }
}
