//! Byte transport to I2C targets.
//!
//! Every `write` is one START..STOP transaction. Backends never retry on
//! their own; retry policy belongs to the programmer and the activation
//! sequencer.

use std::sync::{Arc, Mutex, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;
use thiserror::Error;

/// Pause between read attempts while waiting for a target to answer
const READ_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Pause between attempts to take a shared bus
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("timed out waiting for the target")]
    Timeout,
    #[error("transmission failed: {0}")]
    TransmissionFailed(String),
    #[error("bus is held by another user")]
    BusBusy,
    #[error("0x{0:02X} is not a 7-bit device address")]
    InvalidAddress(u8),
}

pub trait Transport {
    /// Writes `bytes` to `address` as one transaction terminated by STOP.
    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), TransportError>;

    /// Reads up to `max_len` bytes, retrying failed reads until `timeout` has passed.
    fn read(&mut self, address: u8, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Checks that a device acknowledges `address`.
    fn probe(&mut self, address: u8) -> Result<(), TransportError>;

    /// Writes `bytes`, runs `settle` while the target processes them, then
    /// reads the answer. The bus is not given up in between, so no other
    /// transaction can land between a command and its response.
    ///
    /// `Timeout` only comes from the read phase.
    fn write_read(
        &mut self,
        address: u8,
        bytes: &[u8],
        max_len: usize,
        timeout: Duration,
        settle: &mut dyn FnMut(),
    ) -> Result<Vec<u8>, TransportError> {
        self.write(address, bytes)?;
        settle();
        self.read(address, max_len, timeout)
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).write(address, bytes)
    }

    fn read(&mut self, address: u8, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        (**self).read(address, max_len, timeout)
    }

    fn probe(&mut self, address: u8) -> Result<(), TransportError> {
        (**self).probe(address)
    }

    fn write_read(
        &mut self,
        address: u8,
        bytes: &[u8],
        max_len: usize,
        timeout: Duration,
        settle: &mut dyn FnMut(),
    ) -> Result<Vec<u8>, TransportError> {
        (**self).write_read(address, bytes, max_len, timeout, settle)
    }
}

pub(crate) fn check_address(address: u8) -> Result<(), TransportError> {
    if (0x01..=0x7F).contains(&address) {
        Ok(())
    } else {
        Err(TransportError::InvalidAddress(address))
    }
}

/// Repeats `attempt` until it succeeds or `timeout` has elapsed.
/// The first attempt always runs, even with a zero timeout.
pub(crate) fn poll_read<F>(address: u8, timeout: Duration, mut attempt: F) -> Result<Vec<u8>, TransportError>
where
    F: FnMut() -> Result<Vec<u8>, TransportError>,
{
    let deadline = Instant::now() + timeout;
    loop {
        match attempt() {
            Ok(bytes) => return Ok(bytes),
            Err(e) => {
                if Instant::now() >= deadline {
                    debug!("read from 0x{:02X} gave up after {:?}: {}", address, timeout, e);
                    return Err(TransportError::Timeout);
                }
            }
        }
        thread::sleep(READ_POLL_INTERVAL);
    }
}

/// A transport that several owners can use, one transaction at a time.
///
/// Each call takes the bus lock, waiting at most `lock_timeout`. A
/// `write_read` holds it across the write, the settle time and the read.
pub struct SharedBus<T> {
    bus: Arc<Mutex<T>>,
    lock_timeout: Duration,
}

impl<T> Clone for SharedBus<T> {
    fn clone(&self) -> Self {
        Self {
            bus: Arc::clone(&self.bus),
            lock_timeout: self.lock_timeout,
        }
    }
}

impl<T: Transport> SharedBus<T> {
    pub fn new(bus: T, lock_timeout: Duration) -> Self {
        Self {
            bus: Arc::new(Mutex::new(bus)),
            lock_timeout,
        }
    }

    fn with_bus<R, F>(&self, f: F) -> Result<R, TransportError>
    where
        F: FnOnce(&mut T) -> Result<R, TransportError>,
    {
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match self.bus.try_lock() {
                Ok(mut guard) => return f(&mut guard),
                // Each call is a whole transaction, so a poisoned bus holds no partial state
                Err(TryLockError::Poisoned(poisoned)) => return f(&mut poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(TransportError::BusBusy);
                    }
                }
            }
            thread::sleep(LOCK_POLL_INTERVAL);
        }
    }
}

impl<T: Transport> Transport for SharedBus<T> {
    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), TransportError> {
        self.with_bus(|bus| bus.write(address, bytes))
    }

    fn read(&mut self, address: u8, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.with_bus(|bus| bus.read(address, max_len, timeout))
    }

    fn probe(&mut self, address: u8) -> Result<(), TransportError> {
        self.with_bus(|bus| bus.probe(address))
    }

    fn write_read(
        &mut self,
        address: u8,
        bytes: &[u8],
        max_len: usize,
        timeout: Duration,
        settle: &mut dyn FnMut(),
    ) -> Result<Vec<u8>, TransportError> {
        self.with_bus(|bus| bus.write_read(address, bytes, max_len, timeout, settle))
    }
}
