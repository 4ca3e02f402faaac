//! In-memory twiboot target for exercising the whole stack without a bus.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::time::Duration;

use twiboot_bridge::config::{APP_ADDRESS, BOOTLOADER_ADDRESS};
use twiboot_bridge::hex::HexRecord;
use twiboot_bridge::{Bootloader, Config, StdDelay, Transport, TransportError};

pub const FLASH_SIZE: usize = 32 * 1024;

pub struct SimTarget {
    pub flash: Vec<u8>,
    /// Every WriteFlash frame received, accepted or not, as (address, length)
    pub flash_writes: Vec<(u16, usize)>,
    /// Status bytes handed out to the next WriteFlash frames; empty means 0x00
    pub statuses: VecDeque<u8>,
    pub version: [u8; 4],
    pub signature: [u8; 3],
    pub app_present: bool,
    pub in_bootloader: bool,
    pub activation_frames: Vec<Vec<u8>>,
    pub started: bool,
    pending: Option<Vec<u8>>,
}

impl SimTarget {
    /// Erased ATmega328P sitting in the bootloader.
    pub fn new() -> Self {
        Self {
            flash: vec![0xFF; FLASH_SIZE],
            flash_writes: Vec::new(),
            statuses: VecDeque::new(),
            version: [0x03, 0x01, 0x00, 0x00],
            signature: [0x1E, 0x95, 0x0F],
            app_present: false,
            in_bootloader: true,
            activation_frames: Vec::new(),
            started: false,
            pending: None,
        }
    }

    /// Target running its application, bootloader not yet entered.
    pub fn running_app() -> Self {
        Self {
            app_present: true,
            in_bootloader: false,
            ..Self::new()
        }
    }

    fn nack() -> TransportError {
        TransportError::TransmissionFailed("address not acknowledged".to_string())
    }

    fn handle_bootloader(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        match frame {
            [0x01] => self.pending = Some(self.version.to_vec()),
            [0x01, 0x80] => {
                self.started = true;
                self.in_bootloader = false;
            }
            [0x08] => self.pending = Some(self.signature.to_vec()),
            [0x04, hi, lo, len] => {
                let at = u16::from_be_bytes([*hi, *lo]) as usize;
                let end = (at + *len as usize).min(FLASH_SIZE);
                self.pending = Some(self.flash[at.min(end)..end].to_vec());
            }
            [0x06, hi, lo, len, data @ ..] => {
                let at = u16::from_be_bytes([*hi, *lo]);
                assert_eq!(*len as usize, data.len(), "length byte disagrees with payload");
                self.flash_writes.push((at, data.len()));
                let status = self.statuses.pop_front().unwrap_or(0x00);
                if status == 0x00 {
                    let at = at as usize;
                    self.flash[at..at + data.len()].copy_from_slice(data);
                }
                self.pending = Some(vec![status]);
            }
            other => {
                return Err(TransportError::TransmissionFailed(format!(
                    "unexpected frame {:02X?}",
                    other
                )))
            }
        }
        Ok(())
    }
}

impl Transport for SimTarget {
    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), TransportError> {
        match address {
            APP_ADDRESS if self.app_present && !self.in_bootloader => {
                self.activation_frames.push(bytes.to_vec());
                self.in_bootloader = true;
                Ok(())
            }
            BOOTLOADER_ADDRESS if self.in_bootloader => self.handle_bootloader(bytes),
            _ => Err(Self::nack()),
        }
    }

    fn read(&mut self, address: u8, max_len: usize, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if address != BOOTLOADER_ADDRESS || !self.in_bootloader {
            return Err(Self::nack());
        }
        let mut response = self.pending.take().ok_or(TransportError::Timeout)?;
        response.truncate(max_len);
        Ok(response)
    }

    fn probe(&mut self, address: u8) -> Result<(), TransportError> {
        let present = match address {
            APP_ADDRESS => self.app_present && !self.in_bootloader,
            BOOTLOADER_ADDRESS => self.in_bootloader,
            _ => false,
        };
        if present {
            Ok(())
        } else {
            Err(Self::nack())
        }
    }
}

pub fn bootloader(target: SimTarget) -> Bootloader<SimTarget, StdDelay> {
    Bootloader::new(target, StdDelay, Config::default().without_delays())
}

/// HEX text for `data` placed at `address`, 16 bytes per line, with EOF.
pub fn hex_image(address: u16, data: &[u8]) -> String {
    let mut text = String::new();
    for (i, chunk) in data.chunks(16).enumerate() {
        let record = HexRecord::data(address + (i * 16) as u16, chunk.to_vec());
        text.push_str(&record.encode());
        text.push('\n');
    }
    text.push_str(&HexRecord::end_of_file().encode());
    text.push('\n');
    text
}

pub fn counting(len: usize) -> Vec<u8> {
    (0..len).map(|i| i as u8).collect()
}
