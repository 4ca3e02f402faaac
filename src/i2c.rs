use std::fmt::Debug;
use std::time::Duration;

use embedded_hal::blocking::i2c::{Read, Write};
use i2cdev::core::I2CDevice;
use i2cdev::linux::{LinuxI2CDevice, LinuxI2CError};
use log::trace;

use crate::transport::{check_address, poll_read, Transport, TransportError};

fn transmission_failed(e: LinuxI2CError) -> TransportError {
    TransportError::TransmissionFailed(e.to_string())
}

/// A Linux i2c-dev bus (`/dev/i2c-N`).
///
/// The kernel binds one slave address per file handle, so the handle is
/// re-pointed whenever a call targets a different device.
pub struct LinuxI2c {
    device: LinuxI2CDevice,
    address: u8,
}

impl LinuxI2c {
    pub fn new(device_path: &str, address: u8) -> Result<Self, TransportError> {
        check_address(address)?;
        let device = LinuxI2CDevice::new(device_path, address as u16).map_err(|e| {
            TransportError::TransmissionFailed(format!("failed to open {}: {}", device_path, e))
        })?;

        Ok(LinuxI2c { device, address })
    }

    fn select(&mut self, address: u8) -> Result<(), TransportError> {
        check_address(address)?;
        if address != self.address {
            self.device
                .set_slave_address(address as u16)
                .map_err(transmission_failed)?;
            self.address = address;
        }
        Ok(())
    }
}

impl Transport for LinuxI2c {
    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), TransportError> {
        self.select(address)?;
        trace!("i2c 0x{:02X} <- {:02X?}", address, bytes);
        self.device.write(bytes).map_err(transmission_failed)
    }

    fn read(&mut self, address: u8, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.select(address)?;
        let device = &mut self.device;
        let bytes = poll_read(address, timeout, || {
            let mut buffer = vec![0u8; max_len];
            device.read(&mut buffer).map_err(transmission_failed)?;
            Ok(buffer)
        })?;
        trace!("i2c 0x{:02X} -> {:02X?}", address, bytes);
        Ok(bytes)
    }

    fn probe(&mut self, address: u8) -> Result<(), TransportError> {
        self.select(address)?;
        self.device.smbus_write_quick(false).map_err(transmission_failed)
    }
}

/// Any blocking `embedded-hal` I2C bus.
pub struct HalI2c<I2C> {
    bus: I2C,
}

impl<I2C> HalI2c<I2C> {
    pub fn new(bus: I2C) -> Self {
        Self { bus }
    }

    pub fn release(self) -> I2C {
        self.bus
    }
}

impl<E, I2C> Transport for HalI2c<I2C>
where
    E: Debug,
    I2C: Write<Error = E> + Read<Error = E>,
{
    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), TransportError> {
        check_address(address)?;
        trace!("i2c 0x{:02X} <- {:02X?}", address, bytes);
        self.bus
            .write(address, bytes)
            .map_err(|e| TransportError::TransmissionFailed(format!("{:?}", e)))
    }

    fn read(&mut self, address: u8, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        check_address(address)?;
        let bus = &mut self.bus;
        poll_read(address, timeout, || {
            let mut buffer = vec![0u8; max_len];
            bus.read(address, &mut buffer)
                .map_err(|e| TransportError::TransmissionFailed(format!("{:?}", e)))?;
            Ok(buffer)
        })
    }

    fn probe(&mut self, address: u8) -> Result<(), TransportError> {
        // Address-only transaction: START, SLA+W, STOP
        self.write(address, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal_mock::i2c::{Mock, Transaction};
    use embedded_hal_mock::MockError;
    use std::io::ErrorKind;

    #[test]
    fn write_and_read() {
        let expectations = [
            Transaction::write(0x29, vec![0x08]),
            Transaction::read(0x29, vec![0x1E, 0x95, 0x0F]),
        ];
        let mut i2c = HalI2c::new(Mock::new(&expectations));
        i2c.write(0x29, &[0x08]).unwrap();
        let bytes = i2c.read(0x29, 3, Duration::ZERO).unwrap();
        assert_eq!(bytes, vec![0x1E, 0x95, 0x0F]);
        i2c.release().done();
    }

    #[test]
    fn nack_on_write_is_transmission_failure() {
        let expectations =
            [Transaction::write(0x30, vec![0x99, 0xB0]).with_error(MockError::Io(ErrorKind::Other))];
        let mut i2c = HalI2c::new(Mock::new(&expectations));
        let err = i2c.write(0x30, &[0x99, 0xB0]).unwrap_err();
        assert!(matches!(err, TransportError::TransmissionFailed(_)));
        i2c.release().done();
    }

    #[test]
    fn failed_read_past_deadline_is_timeout() {
        let expectations =
            [Transaction::read(0x29, vec![0x00]).with_error(MockError::Io(ErrorKind::Other))];
        let mut i2c = HalI2c::new(Mock::new(&expectations));
        assert_eq!(i2c.read(0x29, 1, Duration::ZERO), Err(TransportError::Timeout));
        i2c.release().done();
    }

    #[test]
    fn probe_is_empty_write() {
        let expectations = [Transaction::write(0x30, vec![])];
        let mut i2c = HalI2c::new(Mock::new(&expectations));
        i2c.probe(0x30).unwrap();
        i2c.release().done();
    }

    #[test]
    fn refuses_ten_bit_address() {
        let mut i2c = HalI2c::new(Mock::new(&[]));
        assert_eq!(i2c.write(0x80, &[0]), Err(TransportError::InvalidAddress(0x80)));
        i2c.release().done();
    }
}
