use std::fmt;

use embedded_hal::blocking::delay::DelayMs;
use log::{debug, info};
use thiserror::Error;

use crate::config::{Config, CHUNK_SIZE, READ_BLOCK_SIZE};
use crate::transport::{Transport, TransportError};

// Write-class status bytes
const STATUS_OK: u8 = 0x00;

// Switch-application frame: the ReadVersion code with a boot type argument
const CMD_SWITCH_APPLICATION: u8 = 0x01;
const BOOTTYPE_APPLICATION: u8 = 0x80;

const VERSION_LEN: usize = 4;
const SIGNATURE_LEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    ReadVersion = 0x01,
    ReadMemory = 0x02,
    WriteMemory = 0x03,
    ReadFlash = 0x04,
    ReadEeprom = 0x05,
    WriteFlash = 0x06,
    WriteEeprom = 0x07,
    ReadSignature = 0x08,
}

impl Command {
    /// Write-class commands answer with a single status byte.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Command::WriteMemory | Command::WriteFlash | Command::WriteEeprom
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no response to {0:?}")]
    NoResponse(Command),
    #[error("bootloader reported status 0x{0:02X}")]
    BootloaderError(u8),
    #[error("{0} data bytes do not fit in one transfer")]
    PayloadTooLarge(usize),
    #[error("expected {expected} response bytes, got {got}")]
    ShortResponse { expected: usize, got: usize },
    #[error("address 0x{0:X} does not fit the 16-bit command address")]
    AddressOutOfRange(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub features: u16,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 3]);

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.0;
        write!(f, "0x{:02X} 0x{:02X} 0x{:02X}", a, b, c)
    }
}

/// State gathered while talking to one bootloader. Dropped with the bootloader.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub last_error: Option<ProtocolError>,
    pub version: Option<Version>,
    pub signature: Option<Signature>,
    pub bytes_written: usize,
    pub commands_sent: usize,
}

/// Twiboot command layer on top of a [`Transport`].
pub struct Bootloader<T, D> {
    transport: T,
    delay: D,
    config: Config,
    session: Session,
}

impl<T, D> Bootloader<T, D>
where
    T: Transport,
    D: DelayMs<u32>,
{
    pub fn new(transport: T, delay: D, config: Config) -> Self {
        Self {
            transport,
            delay,
            config,
            session: Session::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn reset_session(&mut self) {
        self.session = Session::default();
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn delay_ms(&mut self, ms: u32) {
        if ms > 0 {
            self.delay.delay_ms(ms);
        }
    }

    pub fn into_parts(self) -> (T, D) {
        (self.transport, self.delay)
    }

    /// Sends `[cmd, payload...]` and, when `expected_len` is non-zero, reads the answer.
    pub fn send_command(
        &mut self,
        cmd: Command,
        payload: &[u8],
        expected_len: usize,
    ) -> Result<Vec<u8>, ProtocolError> {
        let result = self.exchange(cmd, payload, expected_len);
        if let Err(e) = &result {
            debug!("{:?} failed: {}", cmd, e);
            self.session.last_error = Some(e.clone());
        }
        result
    }

    fn exchange(&mut self, cmd: Command, payload: &[u8], expected_len: usize) -> Result<Vec<u8>, ProtocolError> {
        let address = self.config.bootloader_address;
        let mut frame = Vec::with_capacity(1 + payload.len());
        frame.push(cmd as u8);
        frame.extend_from_slice(payload);

        self.session.commands_sent += 1;
        if expected_len == 0 {
            self.transport.write(address, &frame)?;
            return Ok(Vec::new());
        }

        let processing = self.config.command_delay_ms;
        let delay = &mut self.delay;
        let response = self
            .transport
            .write_read(
                address,
                &frame,
                expected_len,
                self.config.response_timeout,
                &mut || {
                    if processing > 0 {
                        delay.delay_ms(processing);
                    }
                },
            )
            .map_err(|e| match e {
                TransportError::Timeout => ProtocolError::NoResponse(cmd),
                other => ProtocolError::Transport(other),
            })?;

        let Some(&status) = response.first() else {
            return Err(ProtocolError::NoResponse(cmd));
        };
        if cmd.is_write() && status != STATUS_OK {
            return Err(ProtocolError::BootloaderError(status));
        }

        Ok(response)
    }

    fn expect_len(&mut self, response: &[u8], expected: usize) -> Result<(), ProtocolError> {
        if response.len() < expected {
            let e = ProtocolError::ShortResponse {
                expected,
                got: response.len(),
            };
            self.session.last_error = Some(e.clone());
            return Err(e);
        }
        Ok(())
    }

    pub fn read_version(&mut self) -> Result<Version, ProtocolError> {
        let response = self.send_command(Command::ReadVersion, &[], VERSION_LEN)?;
        self.expect_len(&response, VERSION_LEN)?;

        let version = Version {
            major: response[0],
            minor: response[1],
            features: u16::from_le_bytes([response[2], response[3]]),
        };
        debug!("bootloader version {} (features 0x{:04X})", version, version.features);
        self.session.version = Some(version);
        Ok(version)
    }

    pub fn read_signature(&mut self) -> Result<Signature, ProtocolError> {
        let response = self.send_command(Command::ReadSignature, &[], SIGNATURE_LEN)?;
        self.expect_len(&response, SIGNATURE_LEN)?;

        let signature = Signature([response[0], response[1], response[2]]);
        self.session.signature = Some(signature);
        Ok(signature)
    }

    fn read_block(&mut self, cmd: Command, payload: &[u8], len: usize) -> Result<Vec<u8>, ProtocolError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        if len > READ_BLOCK_SIZE {
            return Err(ProtocolError::PayloadTooLarge(len));
        }
        let response = self.send_command(cmd, payload, len)?;
        self.expect_len(&response, len)?;
        Ok(response)
    }

    fn write_block(&mut self, cmd: Command, address: u16, data: &[u8]) -> Result<(), ProtocolError> {
        if data.len() > CHUNK_SIZE {
            return Err(ProtocolError::PayloadTooLarge(data.len()));
        }
        let [hi, lo] = address.to_be_bytes();
        let mut payload = Vec::with_capacity(3 + data.len());
        payload.extend_from_slice(&[hi, lo, data.len() as u8]);
        payload.extend_from_slice(data);

        self.send_command(cmd, &payload, 1)?;
        Ok(())
    }

    pub fn read_memory(&mut self, address: u16, len: usize) -> Result<Vec<u8>, ProtocolError> {
        self.read_block(Command::ReadMemory, &address.to_be_bytes(), len)
    }

    pub fn write_memory(&mut self, address: u16, data: &[u8]) -> Result<(), ProtocolError> {
        self.write_block(Command::WriteMemory, address, data)
    }

    pub fn read_flash(&mut self, address: u16, len: usize) -> Result<Vec<u8>, ProtocolError> {
        let [hi, lo] = address.to_be_bytes();
        self.read_block(Command::ReadFlash, &[hi, lo, len as u8], len)
    }

    pub fn read_eeprom(&mut self, address: u16, len: usize) -> Result<Vec<u8>, ProtocolError> {
        let [hi, lo] = address.to_be_bytes();
        self.read_block(Command::ReadEeprom, &[hi, lo, len as u8], len)
    }

    /// Writes at most [`CHUNK_SIZE`] bytes of flash; larger writes must be chunked by the caller.
    pub fn write_flash(&mut self, address: u16, data: &[u8]) -> Result<(), ProtocolError> {
        self.write_block(Command::WriteFlash, address, data)?;
        self.session.bytes_written += data.len();
        Ok(())
    }

    pub fn write_eeprom(&mut self, address: u16, data: &[u8]) -> Result<(), ProtocolError> {
        self.write_block(Command::WriteEeprom, address, data)
    }

    pub fn read_flash_block(&mut self, address: u16, len: usize) -> Result<Vec<u8>, ProtocolError> {
        self.read_spanning(Command::ReadFlash, address, len)
    }

    pub fn read_eeprom_block(&mut self, address: u16, len: usize) -> Result<Vec<u8>, ProtocolError> {
        self.read_spanning(Command::ReadEeprom, address, len)
    }

    fn read_spanning(&mut self, cmd: Command, address: u16, len: usize) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let at = chunk_address(address, out.len())?;
            let n = READ_BLOCK_SIZE.min(len - out.len());
            let [hi, lo] = at.to_be_bytes();
            let block = self.read_block(cmd, &[hi, lo, n as u8], n)?;
            out.extend_from_slice(&block[..n]);
        }
        Ok(out)
    }

    /// Writes EEPROM of any length in [`CHUNK_SIZE`] pieces.
    pub fn write_eeprom_block(&mut self, address: u16, data: &[u8]) -> Result<(), ProtocolError> {
        for (i, chunk) in data.chunks(CHUNK_SIZE).enumerate() {
            let at = chunk_address(address, i * CHUNK_SIZE)?;
            self.write_eeprom(at, chunk)?;
            let settle = self.config.chunk_settle_ms;
            self.delay_ms(settle);
        }
        Ok(())
    }

    /// Asks the bootloader to start the application. No answer is expected.
    pub fn leave_bootloader(&mut self) -> Result<(), ProtocolError> {
        info!("starting application");
        let address = self.config.bootloader_address;
        self.session.commands_sent += 1;
        self.transport
            .write(address, &[CMD_SWITCH_APPLICATION, BOOTTYPE_APPLICATION])
            .map_err(|e| {
                let e = ProtocolError::from(e);
                self.session.last_error = Some(e.clone());
                e
            })
    }
}

fn chunk_address(base: u16, offset: usize) -> Result<u16, ProtocolError> {
    let address = base as u32 + offset as u32;
    u16::try_from(address).map_err(|_| ProtocolError::AddressOutOfRange(address))
}
