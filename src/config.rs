use std::ops::Range;
use std::time::Duration;

/// Twiboot bootloader I2C address (7-bit)
pub const BOOTLOADER_ADDRESS: u8 = 0x29;

/// Application I2C address, the one that accepts the "enter bootloader" request
pub const APP_ADDRESS: u8 = 0x30;

// Application register protocol: write MAGIC to REGISTER to reboot into the bootloader
pub const ACTIVATION_REGISTER: u8 = 0x99;
pub const ACTIVATION_MAGIC: u8 = 0xB0;

/// Single-byte activation request understood by older application firmware ('B')
pub const LEGACY_ACTIVATION_BYTE: u8 = 0x42;

/// Bootloader section of an ATmega328P, never written
pub const RESERVED_RANGE: Range<u32> = 0x7C00..0x8000;

/// Flash erase page of an ATmega328P
pub const PAGE_SIZE: usize = 128;

/// Data bytes per write transaction; the bridge's transfer buffer holds no more
pub const CHUNK_SIZE: usize = 16;

/// Largest single read transfer
pub const READ_BLOCK_SIZE: usize = 128;

/// Progress total assumed when the image size is not known up front (typical 32K sketch)
pub const ESTIMATED_IMAGE_SIZE: usize = 32 * 1024;

/// Progress is reported each time this many more bytes have been written
pub const PROGRESS_INTERVAL: usize = 256;

// Delays, all in milliseconds

/// Command decode time inside the bootloader before its response is readable
pub const COMMAND_PROCESSING_DELAY_MS: u32 = 10;

/// Lets the target absorb a chunk into its page buffer
pub const CHUNK_SETTLE_DELAY_MS: u32 = 5;

/// Page erase + program time after the last chunk of a page
pub const PAGE_SETTLE_DELAY_MS: u32 = 10;

/// Added per failed attempt before a chunk is resent
pub const RETRY_BACKOFF_STEP_MS: u32 = 5;

/// Spacing between activation command attempts
pub const ACTIVATION_RETRY_DELAY_MS: u32 = 100;

/// Application stores its boot flag, resets through the watchdog and the bootloader starts.
/// The target is silent during reset, so this is a fixed wait and not a poll.
pub const REBOOT_WAIT_MS: u32 = 2000;

/// Spacing between version queries while waiting for the bootloader
pub const VERSION_QUERY_INTERVAL_MS: u32 = 500;

/// Default time allowed for a response to become readable
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(100);

/// How the application is asked to jump into its bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationCommand {
    /// Register write with a safety value, `[register, value]`
    RegisterMagic { register: u8, value: u8 },
    /// One magic command byte
    MagicByte(u8),
}

impl ActivationCommand {
    pub fn frame(&self) -> Vec<u8> {
        match *self {
            ActivationCommand::RegisterMagic { register, value } => vec![register, value],
            ActivationCommand::MagicByte(byte) => vec![byte],
        }
    }
}

impl Default for ActivationCommand {
    fn default() -> Self {
        ActivationCommand::RegisterMagic {
            register: ACTIVATION_REGISTER,
            value: ACTIVATION_MAGIC,
        }
    }
}

/// Everything the core needs to know about the bus layout and the target.
///
/// Defaults match an ATmega328P running twiboot behind an application that
/// listens on 0x30.
#[derive(Debug, Clone)]
pub struct Config {
    pub bootloader_address: u8,
    pub app_address: u8,
    pub activation: ActivationCommand,
    pub page_size: usize,
    pub reserved: Range<u32>,
    pub response_timeout: Duration,

    pub chunk_attempts: u32,
    pub activation_attempts: u32,
    pub version_attempts: u32,

    pub command_delay_ms: u32,
    pub chunk_settle_ms: u32,
    pub page_settle_ms: u32,
    pub retry_backoff_ms: u32,
    pub activation_retry_ms: u32,
    pub reboot_wait_ms: u32,
    pub version_interval_ms: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootloader_address: BOOTLOADER_ADDRESS,
            app_address: APP_ADDRESS,
            activation: ActivationCommand::default(),
            page_size: PAGE_SIZE,
            reserved: RESERVED_RANGE,
            response_timeout: RESPONSE_TIMEOUT,
            chunk_attempts: 3,
            activation_attempts: 3,
            version_attempts: 5,
            command_delay_ms: COMMAND_PROCESSING_DELAY_MS,
            chunk_settle_ms: CHUNK_SETTLE_DELAY_MS,
            page_settle_ms: PAGE_SETTLE_DELAY_MS,
            retry_backoff_ms: RETRY_BACKOFF_STEP_MS,
            activation_retry_ms: ACTIVATION_RETRY_DELAY_MS,
            reboot_wait_ms: REBOOT_WAIT_MS,
            version_interval_ms: VERSION_QUERY_INTERVAL_MS,
        }
    }
}

impl Config {
    /// Checks the values that the programmer relies on for its address math.
    pub fn validate(&self) -> Result<(), String> {
        for (name, address) in [
            ("bootloader", self.bootloader_address),
            ("application", self.app_address),
        ] {
            if !(0x01..=0x7F).contains(&address) {
                return Err(format!(
                    "{} address 0x{:02X} is outside 0x01-0x7F",
                    name, address
                ));
            }
        }
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(format!("page size {} is not a power of two", self.page_size));
        }
        if self.page_size > 0x1_0000 {
            return Err(format!("page size {} exceeds the 16-bit address space", self.page_size));
        }
        if self.reserved.start > self.reserved.end {
            return Err(format!(
                "reserved range 0x{:X}..0x{:X} is reversed",
                self.reserved.start, self.reserved.end
            ));
        }
        if self.chunk_attempts == 0 || self.activation_attempts == 0 || self.version_attempts == 0 {
            return Err("attempt counts must be at least 1".to_string());
        }
        Ok(())
    }

    /// Same configuration with every delay set to zero, for simulated targets.
    pub fn without_delays(mut self) -> Self {
        self.command_delay_ms = 0;
        self.chunk_settle_ms = 0;
        self.page_settle_ms = 0;
        self.retry_backoff_ms = 0;
        self.activation_retry_ms = 0;
        self.reboot_wait_ms = 0;
        self.version_interval_ms = 0;
        self
    }
}
