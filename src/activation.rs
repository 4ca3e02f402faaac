//! Moves the target from its application into the twiboot bootloader.
//!
//! ```text
//! Idle -> PingingApp -> SendingActivationCommand -> WaitingForReboot
//!      -> PingingBootloader -> QueryingVersion -> Active
//! ```
//!
//! Any step can end in `Failed`.

use std::fmt;

use embedded_hal::blocking::delay::DelayMs;
use log::{debug, error, info, warn};
use thiserror::Error;

use crate::protocol::{Bootloader, ProtocolError, Version};
use crate::transport::{Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    Idle,
    PingingApp,
    SendingActivationCommand,
    WaitingForReboot,
    PingingBootloader,
    QueryingVersion,
    Active,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActivationError {
    #[error("application at 0x{address:02X} is not responding: {source}")]
    AppNotResponding {
        address: u8,
        #[source]
        source: TransportError,
    },
    #[error("activation command not accepted after {attempts} attempts: {source}")]
    ActivationCommandFailed {
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("bootloader did not answer after {attempts} version queries: {source}")]
    BootloaderNotResponding {
        attempts: u32,
        #[source]
        source: ProtocolError,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// What the bootloader reported once it came up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootloaderInfo {
    pub version: Version,
}

impl fmt::Display for BootloaderInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.version, f)
    }
}

pub struct Activator<'a, T, D> {
    bootloader: &'a mut Bootloader<T, D>,
    state: ActivationState,
}

impl<'a, T, D> Activator<'a, T, D>
where
    T: Transport,
    D: DelayMs<u32>,
{
    pub fn new(bootloader: &'a mut Bootloader<T, D>) -> Self {
        Self {
            bootloader,
            state: ActivationState::Idle,
        }
    }

    pub fn state(&self) -> ActivationState {
        self.state
    }

    fn enter(&mut self, state: ActivationState) {
        debug!("activation: {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Runs the whole sequence. Blocks for at least the reboot wait.
    ///
    /// An application that does not answer the first ping is not retried;
    /// the target has to be power cycled before trying again.
    pub fn activate(&mut self) -> Result<BootloaderInfo, ActivationError> {
        self.enter(ActivationState::Idle);
        match self.run() {
            Ok(info) => {
                self.enter(ActivationState::Active);
                info!("bootloader active, version {}", info);
                Ok(info)
            }
            Err(e) => {
                self.enter(ActivationState::Failed);
                error!("activation failed: {}", e);
                Err(e)
            }
        }
    }

    fn run(&mut self) -> Result<BootloaderInfo, ActivationError> {
        let config = self.bootloader.config().clone();
        config.validate().map_err(ActivationError::InvalidConfig)?;
        let app = config.app_address;

        self.enter(ActivationState::PingingApp);
        self.bootloader
            .transport_mut()
            .probe(app)
            .map_err(|source| ActivationError::AppNotResponding { address: app, source })?;

        self.enter(ActivationState::SendingActivationCommand);
        let frame = config.activation.frame();
        info!("requesting bootloader mode from 0x{:02X} with {:02X?}", app, frame);
        let mut attempt = 1;
        loop {
            match self.bootloader.transport_mut().write(app, &frame) {
                Ok(()) => break,
                Err(e) if attempt < config.activation_attempts => {
                    warn!("activation command attempt {} failed: {}", attempt, e);
                    self.bootloader.delay_ms(config.activation_retry_ms);
                    attempt += 1;
                }
                Err(source) => {
                    return Err(ActivationError::ActivationCommandFailed {
                        attempts: attempt,
                        source,
                    })
                }
            }
        }

        self.enter(ActivationState::WaitingForReboot);
        info!("waiting {} ms for the target to reboot", config.reboot_wait_ms);
        self.bootloader.delay_ms(config.reboot_wait_ms);

        self.enter(ActivationState::PingingBootloader);
        if let Err(e) = self.bootloader.transport_mut().probe(config.bootloader_address) {
            // The version query below decides; some targets ignore address-only probes
            warn!(
                "bootloader at 0x{:02X} did not acknowledge a probe: {}",
                config.bootloader_address, e
            );
        }

        self.enter(ActivationState::QueryingVersion);
        let mut attempt = 1;
        loop {
            match self.bootloader.read_version() {
                Ok(version) => return Ok(BootloaderInfo { version }),
                Err(e) if attempt < config.version_attempts => {
                    warn!("version query {} failed: {}", attempt, e);
                    self.bootloader.delay_ms(config.version_interval_ms);
                    attempt += 1;
                }
                Err(source) => {
                    return Err(ActivationError::BootloaderNotResponding {
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }
}
