//! Host side of the twiboot I2C bootloader bridge.
//!
//! [`activation`] brings the target from its application into the
//! bootloader, [`programmer`] streams [`hex`] records into flash pages, and
//! [`protocol`] speaks the bootloader command set over a [`transport`].

pub mod activation;
pub mod config;
pub mod delay;
pub mod hex;
pub mod i2c;
pub mod programmer;
pub mod protocol;
pub mod transport;

pub use activation::{ActivationError, ActivationState, Activator, BootloaderInfo};
pub use config::{ActivationCommand, Config};
pub use delay::StdDelay;
pub use hex::{HexError, HexRecord, LineError, RecordType};
pub use i2c::{HalI2c, LinuxI2c};
pub use programmer::{CancelFlag, Programmer, Supervisor, UploadError, UploadReport};
pub use protocol::{Bootloader, Command, ProtocolError, Session, Signature, Version};
pub use transport::{SharedBus, Transport, TransportError};
