use std::thread;
use std::time::Duration;

use embedded_hal::blocking::delay::DelayMs;

/// Blocking delay backed by `thread::sleep`.
pub struct StdDelay;

impl DelayMs<u32> for StdDelay {
    fn delay_ms(&mut self, ms: u32) {
        thread::sleep(Duration::from_millis(ms.into()));
    }
}

/// Records requested delays instead of sleeping.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct TallyDelay {
    pub calls: Vec<u32>,
}

#[cfg(test)]
impl TallyDelay {
    pub fn total_ms(&self) -> u64 {
        self.calls.iter().map(|&ms| u64::from(ms)).sum()
    }
}

#[cfg(test)]
impl DelayMs<u32> for TallyDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.calls.push(ms);
    }
}
