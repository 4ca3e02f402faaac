use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use twiboot_bridge::hex::{self, HexRecord, LineError};

#[derive(Debug, Clone, Copy)]
pub enum FileFormat {
    Binary,
    Hex,
    Auto,
}

impl FileFormat {
    pub fn from_extension(path: &Path) -> Self {
        match path.extension().and_then(|s| s.to_str()) {
            Some("hex") | Some("ihex") => FileFormat::Hex,
            Some("bin") => FileFormat::Binary,
            _ => FileFormat::Auto,
        }
    }
}

/// A firmware image as loaded from disk
pub enum Firmware {
    Hex(String),
    Binary(Vec<u8>),
}

impl Firmware {
    /// Record stream for the programmer. Binary images load at address 0.
    pub fn records(&self) -> Box<dyn Iterator<Item = Result<HexRecord, LineError>> + '_> {
        match self {
            Firmware::Hex(text) => Box::new(hex::records(text)),
            Firmware::Binary(data) => {
                let records = hex::records_from_binary(data, 0);
                Box::new(records.into_iter().map(Ok::<_, LineError>))
            }
        }
    }

    pub fn data_len(&self) -> usize {
        match self {
            Firmware::Hex(text) => hex::data_len(text),
            Firmware::Binary(data) => data.len(),
        }
    }
}

pub fn read_firmware(path: &Path, format: FileFormat) -> Result<Firmware> {
    let data =
        fs::read(path).with_context(|| format!("Failed to read file: {}", path.display()))?;

    let as_hex = |data: Vec<u8>| -> Result<Firmware> {
        let text = String::from_utf8(data).context("Invalid UTF-8 in hex file")?;
        Ok(Firmware::Hex(text))
    };

    match format {
        FileFormat::Binary => Ok(Firmware::Binary(data)),
        FileFormat::Hex => as_hex(data),
        FileFormat::Auto => {
            // Try to detect format
            if data.starts_with(b":") {
                as_hex(data)
            } else {
                Ok(Firmware::Binary(data))
            }
        }
    }
}
