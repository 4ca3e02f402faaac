//! Streams HEX records into page-sized buffers and writes them through the
//! bootloader in chunks.
//!
//! Bytes are collected into one erase page at a time. A page is flushed as
//! soon as a byte for a different page arrives, and once more at the end of
//! the stream. Page bytes not covered by any record stay `0xFF`. Bytes inside
//! the reserved bootloader range never reach the target.

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use embedded_hal::blocking::delay::DelayMs;
use log::{debug, error, info, warn};
use thiserror::Error;

use crate::config::{CHUNK_SIZE, ESTIMATED_IMAGE_SIZE, PROGRESS_INTERVAL, READ_BLOCK_SIZE};
use crate::hex::{HexRecord, RecordType};
use crate::protocol::{Bootloader, ProtocolError};
use crate::transport::Transport;

/// Highest address the 2-byte command address can reach
const MAX_COMMAND_ADDRESS: u32 = 0xFFFF;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    #[error("writing chunk at 0x{address:04X} failed after {attempts} attempts: {source}")]
    ChunkWriteFailed {
        address: u32,
        attempts: u32,
        #[source]
        source: ProtocolError,
    },
    #[error("{0} records were rejected")]
    PartialFailure(usize),
    #[error("cancelled after {bytes_written} bytes were written")]
    Cancelled { bytes_written: usize },
    #[error("verify failed at 0x{address:04X}: expected 0x{expected:02X}, read 0x{found:02X}")]
    VerifyFailed { address: u32, expected: u8, found: u8 },
    #[error("reading back 0x{address:04X} failed after {attempts} attempts: {source}")]
    ReadFailed {
        address: u32,
        attempts: u32,
        #[source]
        source: ProtocolError,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Hook the programmer calls before every chunk transfer.
pub trait Supervisor {
    /// Keeps a hardware or task watchdog alive during long uploads.
    fn feed_watchdog(&mut self) {}

    /// Returning true stops the upload before the next chunk.
    fn should_cancel(&self) -> bool {
        false
    }
}

impl Supervisor for () {}

/// Cancellation flag that can be set from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Supervisor for CancelFlag {
    fn should_cancel(&self) -> bool {
        self.is_cancelled()
    }
}

/// Counters of the last upload or verify run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Record data bytes placed into pages
    pub data_bytes: usize,
    /// Bytes sent in chunks, `0xFF` filler included
    pub bytes_sent: usize,
    pub pages: usize,
    pub chunks: usize,
    pub retries: usize,
    /// Data records dropped because they start in the reserved range
    pub reserved_records: usize,
    /// Single bytes dropped because they run into the reserved range
    pub reserved_bytes: usize,
    pub rejected_records: usize,
}

impl fmt::Display for UploadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes in {} pages ({} chunks, {} retries, {} reserved records skipped, {} rejected)",
            self.data_bytes,
            self.pages,
            self.chunks,
            self.retries,
            self.reserved_records,
            self.rejected_records
        )
    }
}

/// One erase page worth of bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Page {
    pub base: u32,
    pub data: Vec<u8>,
}

impl Page {
    fn erased(base: u32, size: usize) -> Self {
        Self {
            base,
            data: vec![0xFF; size],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Stop,
}

/// Folds records into pages, handing each finished page to a flush callback.
pub(crate) struct Pager {
    page_size: usize,
    reserved: Range<u32>,
    extended: u16,
    page: Option<Page>,
    pub data_bytes: usize,
    pub reserved_records: usize,
    pub reserved_bytes: usize,
    pub rejected: usize,
}

impl Pager {
    pub fn new(page_size: usize, reserved: Range<u32>) -> Self {
        Self {
            page_size,
            reserved,
            extended: 0,
            page: None,
            data_bytes: 0,
            reserved_records: 0,
            reserved_bytes: 0,
            rejected: 0,
        }
    }

    fn align(&self, address: u32) -> u32 {
        address & !(self.page_size as u32 - 1)
    }

    fn feed<F>(&mut self, record: &HexRecord, flush: &mut F) -> Result<Step, UploadError>
    where
        F: FnMut(&Page) -> Result<(), UploadError>,
    {
        match record.kind {
            RecordType::Data => self.feed_data(record, flush)?,
            RecordType::ExtendedLinearAddress => {
                if let Some(upper) = record.upper_address() {
                    debug!("extended address 0x{:04X}", upper);
                    self.extended = upper;
                }
            }
            RecordType::EndOfFile => return Ok(Step::Stop),
            other => debug!("ignoring {:?} record", other),
        }
        Ok(Step::Continue)
    }

    fn feed_data<F>(&mut self, record: &HexRecord, flush: &mut F) -> Result<(), UploadError>
    where
        F: FnMut(&Page) -> Result<(), UploadError>,
    {
        let full = (self.extended as u32) << 16 | record.address as u32;
        if self.reserved.contains(&full) {
            info!("skipping bootloader section at 0x{:04X}", full);
            self.reserved_records += 1;
            return Ok(());
        }

        let mut out_of_range = false;
        for (i, &byte) in record.data.iter().enumerate() {
            let address = full.saturating_add(i as u32);
            if self.reserved.contains(&address) {
                self.reserved_bytes += 1;
                continue;
            }
            if address > MAX_COMMAND_ADDRESS {
                out_of_range = true;
                continue;
            }

            let base = self.align(address);
            if self.page.as_ref().map_or(false, |page| page.base != base) {
                if let Some(page) = self.page.take() {
                    flush(&page)?;
                }
            }
            let size = self.page_size;
            let page = self.page.get_or_insert_with(|| {
                debug!("starting page at 0x{:04X}", base);
                Page::erased(base, size)
            });
            page.data[(address - base) as usize] = byte;
            self.data_bytes += 1;
        }

        if out_of_range {
            warn!(
                "record at 0x{:X} reaches past 0xFFFF, dropped bytes beyond the command address range",
                full
            );
            self.rejected += 1;
        }
        Ok(())
    }

    fn finish<F>(&mut self, flush: &mut F) -> Result<(), UploadError>
    where
        F: FnMut(&Page) -> Result<(), UploadError>,
    {
        match self.page.take() {
            Some(page) => flush(&page),
            None => Ok(()),
        }
    }
}

/// Offsets of a `len`-byte run at `start` that lie outside `reserved`, as contiguous ranges.
pub(crate) fn writable_runs(start: u32, len: usize, reserved: &Range<u32>) -> Vec<Range<usize>> {
    let mut runs = Vec::new();
    let mut open = None;
    for i in 0..len {
        let free = !reserved.contains(&(start + i as u32));
        match (free, open) {
            (true, None) => open = Some(i),
            (false, Some(from)) => {
                runs.push(from..i);
                open = None;
            }
            _ => {}
        }
    }
    if let Some(from) = open {
        runs.push(from..len);
    }
    runs
}

fn percent(done: usize, total: usize) -> u8 {
    (done * 100 / total.max(1)).min(99) as u8
}

/// Calls back each time another [`PROGRESS_INTERVAL`] bytes have crossed the bus.
struct Progress<'p> {
    callback: &'p mut dyn FnMut(u8),
    total: usize,
    reported: usize,
}

impl Progress<'_> {
    fn update(&mut self, done: usize) {
        let marks = done / PROGRESS_INTERVAL;
        if marks > self.reported {
            self.reported = marks;
            (self.callback)(percent(done, self.total));
        }
    }
}

/// Drives page writes for one upload.
pub struct Programmer<'a, T, D, S = ()> {
    bootloader: &'a mut Bootloader<T, D>,
    supervisor: S,
    expected_size: Option<usize>,
    report: UploadReport,
}

impl<'a, T, D> Programmer<'a, T, D>
where
    T: Transport,
    D: DelayMs<u32>,
{
    pub fn new(bootloader: &'a mut Bootloader<T, D>) -> Self {
        Self {
            bootloader,
            supervisor: (),
            expected_size: None,
            report: UploadReport::default(),
        }
    }
}

impl<'a, T, D, S> Programmer<'a, T, D, S>
where
    T: Transport,
    D: DelayMs<u32>,
    S: Supervisor,
{
    pub fn with_supervisor<S2: Supervisor>(self, supervisor: S2) -> Programmer<'a, T, D, S2> {
        Programmer {
            bootloader: self.bootloader,
            supervisor,
            expected_size: self.expected_size,
            report: self.report,
        }
    }

    /// Total data bytes of the image, for exact progress figures.
    pub fn with_expected_size(mut self, bytes: usize) -> Self {
        self.expected_size = Some(bytes).filter(|&n| n > 0);
        self
    }

    pub fn last_report(&self) -> &UploadReport {
        &self.report
    }

    /// Writes the records to flash and returns the number of record data bytes written.
    ///
    /// `progress` counts bytes sent to the target, `0xFF` filler included,
    /// and is checked after every chunk.
    ///
    /// Rejected records (parse errors) are skipped and counted; if any were
    /// seen the upload still runs to the end and then fails with
    /// [`UploadError::PartialFailure`].
    pub fn upload<I, E, P>(&mut self, records: I, mut progress: P) -> Result<usize, UploadError>
    where
        I: IntoIterator<Item = Result<HexRecord, E>>,
        E: fmt::Display,
        P: FnMut(u8),
    {
        let config = self.bootloader.config().clone();
        config.validate().map_err(UploadError::InvalidConfig)?;
        info!(
            "uploading to bootloader 0x{:02X}, {} byte pages, reserved 0x{:04X}..0x{:04X}",
            config.bootloader_address, config.page_size, config.reserved.start, config.reserved.end
        );

        let total = self.expected_size.unwrap_or(ESTIMATED_IMAGE_SIZE);
        let mut pager = Pager::new(config.page_size, config.reserved.clone());
        let mut report = UploadReport::default();

        let result = self.run(records, &mut pager, &mut report, &mut progress, total, Self::write_page);

        report.data_bytes = pager.data_bytes;
        report.reserved_records = pager.reserved_records;
        report.reserved_bytes = pager.reserved_bytes;
        report.rejected_records = pager.rejected;
        self.report = report;

        match result {
            Ok(()) if pager.rejected > 0 => {
                error!("upload finished with {} rejected records", pager.rejected);
                Err(UploadError::PartialFailure(pager.rejected))
            }
            Ok(()) => {
                progress(100);
                info!("upload complete: {}", self.report);
                Ok(pager.data_bytes)
            }
            Err(e) => {
                error!("upload failed: {}", e);
                Err(e)
            }
        }
    }

    /// Reads every page the records describe back from the target and compares it.
    /// Returns the number of bytes compared.
    pub fn verify<I, E, P>(&mut self, records: I, mut progress: P) -> Result<usize, UploadError>
    where
        I: IntoIterator<Item = Result<HexRecord, E>>,
        E: fmt::Display,
        P: FnMut(u8),
    {
        let config = self.bootloader.config().clone();
        config.validate().map_err(UploadError::InvalidConfig)?;

        let total = self.expected_size.unwrap_or(ESTIMATED_IMAGE_SIZE);
        let mut pager = Pager::new(config.page_size, config.reserved.clone());
        let mut report = UploadReport::default();

        let result = self.run(records, &mut pager, &mut report, &mut progress, total, Self::verify_page);
        report.data_bytes = pager.data_bytes;
        report.rejected_records = pager.rejected;
        self.report = report;
        result?;

        if pager.rejected > 0 {
            return Err(UploadError::PartialFailure(pager.rejected));
        }
        progress(100);
        info!("verified {} bytes in {} pages", self.report.bytes_sent, self.report.pages);
        Ok(self.report.bytes_sent)
    }

    fn run<I, E, W>(
        &mut self,
        records: I,
        pager: &mut Pager,
        report: &mut UploadReport,
        progress: &mut dyn FnMut(u8),
        total: usize,
        page_op: W,
    ) -> Result<(), UploadError>
    where
        I: IntoIterator<Item = Result<HexRecord, E>>,
        E: fmt::Display,
        W: Fn(&mut Self, &Page, &mut UploadReport, &mut Progress<'_>) -> Result<(), UploadError>,
    {
        let mut tracker = Progress {
            callback: progress,
            total,
            reported: 0,
        };
        let mut flush = |page: &Page| page_op(self, page, report, &mut tracker);

        for item in records {
            let record = match item {
                Ok(record) => record,
                Err(e) => {
                    warn!("skipping rejected record: {}", e);
                    pager.rejected += 1;
                    continue;
                }
            };

            let step = pager.feed(&record, &mut flush)?;
            if step == Step::Stop {
                debug!("end of file record");
                break;
            }
        }

        pager.finish(&mut flush)
    }

    fn checkpoint(&mut self, report: &UploadReport) -> Result<(), UploadError> {
        self.supervisor.feed_watchdog();
        if self.supervisor.should_cancel() {
            warn!("upload cancelled");
            return Err(UploadError::Cancelled {
                bytes_written: report.bytes_sent,
            });
        }
        Ok(())
    }

    fn write_page(
        &mut self,
        page: &Page,
        report: &mut UploadReport,
        progress: &mut Progress<'_>,
    ) -> Result<(), UploadError> {
        debug!("writing page at 0x{:04X}", page.base);
        let reserved = self.bootloader.config().reserved.clone();
        let chunk_settle = self.bootloader.config().chunk_settle_ms;
        let page_settle = self.bootloader.config().page_settle_ms;

        for (n, chunk) in page.data.chunks(CHUNK_SIZE).enumerate() {
            let start = page.base + (n * CHUNK_SIZE) as u32;
            for run in writable_runs(start, chunk.len(), &reserved) {
                self.checkpoint(report)?;
                let address = start + run.start as u32;
                self.write_chunk(address, &chunk[run], report)?;
                progress.update(report.bytes_sent);
                self.bootloader.delay_ms(chunk_settle);
            }
        }

        self.bootloader.delay_ms(page_settle);
        report.pages += 1;
        Ok(())
    }

    fn write_chunk(&mut self, address: u32, data: &[u8], report: &mut UploadReport) -> Result<(), UploadError> {
        let attempts = self.bootloader.config().chunk_attempts;
        let backoff = self.bootloader.config().retry_backoff_ms;
        let command_address = u16::try_from(address).map_err(|_| UploadError::ChunkWriteFailed {
            address,
            attempts: 0,
            source: ProtocolError::AddressOutOfRange(address),
        })?;

        let mut attempt = 1;
        loop {
            match self.bootloader.write_flash(command_address, data) {
                Ok(()) => {
                    report.chunks += 1;
                    report.bytes_sent += data.len();
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        "chunk at 0x{:04X} failed (attempt {}/{}): {}",
                        address, attempt, attempts, e
                    );
                    report.retries += 1;
                    self.bootloader.delay_ms(backoff * attempt);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(UploadError::ChunkWriteFailed {
                        address,
                        attempts: attempt,
                        source: e,
                    })
                }
            }
        }
    }

    fn verify_page(
        &mut self,
        page: &Page,
        report: &mut UploadReport,
        progress: &mut Progress<'_>,
    ) -> Result<(), UploadError> {
        let reserved = self.bootloader.config().reserved.clone();

        for (n, block) in page.data.chunks(READ_BLOCK_SIZE).enumerate() {
            let start = page.base + (n * READ_BLOCK_SIZE) as u32;
            for run in writable_runs(start, block.len(), &reserved) {
                self.checkpoint(report)?;
                let address = start + run.start as u32;
                let expected = &block[run];
                let found = self.read_back(address, expected.len(), report)?;

                if let Some(i) = expected.iter().zip(&found).position(|(a, b)| a != b) {
                    return Err(UploadError::VerifyFailed {
                        address: address + i as u32,
                        expected: expected[i],
                        found: found[i],
                    });
                }
                report.chunks += 1;
                report.bytes_sent += expected.len();
                progress.update(report.bytes_sent);
            }
        }

        report.pages += 1;
        Ok(())
    }

    fn read_back(&mut self, address: u32, len: usize, report: &mut UploadReport) -> Result<Vec<u8>, UploadError> {
        let attempts = self.bootloader.config().chunk_attempts;
        let backoff = self.bootloader.config().retry_backoff_ms;
        let command_address = u16::try_from(address).map_err(|_| UploadError::ReadFailed {
            address,
            attempts: 0,
            source: ProtocolError::AddressOutOfRange(address),
        })?;

        let mut attempt = 1;
        loop {
            match self.bootloader.read_flash(command_address, len) {
                Ok(bytes) => return Ok(bytes),
                Err(e) if attempt < attempts => {
                    warn!("reading 0x{:04X} failed (attempt {}/{}): {}", address, attempt, attempts, e);
                    report.retries += 1;
                    self.bootloader.delay_ms(backoff * attempt);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(UploadError::ReadFailed {
                        address,
                        attempts: attempt,
                        source: e,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::delay::TallyDelay;
    use crate::hex::HexError;
    use crate::transport::TransportError;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Answers every command with the next scripted status, 0x00 once the script runs out.
    #[derive(Default)]
    struct StatusScript {
        statuses: VecDeque<u8>,
        frames: usize,
    }

    impl Transport for StatusScript {
        fn write(&mut self, _address: u8, _bytes: &[u8]) -> Result<(), TransportError> {
            self.frames += 1;
            Ok(())
        }

        fn read(&mut self, _address: u8, _max_len: usize, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
            Ok(vec![self.statuses.pop_front().unwrap_or(0x00)])
        }

        fn probe(&mut self, _address: u8) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn timed_bootloader(statuses: &[u8], config: Config) -> Bootloader<StatusScript, TallyDelay> {
        let transport = StatusScript {
            statuses: statuses.iter().copied().collect(),
            frames: 0,
        };
        Bootloader::new(transport, TallyDelay::default(), config)
    }

    fn full_page() -> [Result<HexRecord, HexError>; 1] {
        [Ok(HexRecord::data(0x0000, vec![0xAA; 128]))]
    }

    #[test]
    fn backoff_grows_then_chunks_and_page_settle() {
        let config = Config {
            command_delay_ms: 0,
            ..Config::default()
        };
        let mut bl = timed_bootloader(&[0xFF, 0xFF], config);
        Programmer::new(&mut bl).upload(full_page(), |_| {}).unwrap();

        let (transport, delay) = bl.into_parts();
        assert_eq!(transport.frames, 10);
        // 5 ms per failed attempt so far, then one settle per chunk, then the page
        let mut expected = vec![5, 10];
        expected.extend([5; 8]);
        expected.push(10);
        assert_eq!(delay.calls, expected);
    }

    #[test]
    fn every_answer_waits_for_command_processing() {
        let mut bl = timed_bootloader(&[], Config::default());
        Programmer::new(&mut bl).upload(full_page(), |_| {}).unwrap();

        let (_, delay) = bl.into_parts();
        let mut expected = Vec::new();
        for _ in 0..8 {
            expected.extend([10, 5]);
        }
        expected.push(10);
        assert_eq!(delay.calls, expected);
    }

    #[test]
    fn exhausted_chunk_stops_before_settling() {
        let mut bl = timed_bootloader(&[0xFF; 3], Config::default().without_delays());
        let err = Programmer::new(&mut bl).upload(full_page(), |_| {}).unwrap_err();
        assert!(matches!(err, UploadError::ChunkWriteFailed { address: 0, attempts: 3, .. }));
        let (transport, delay) = bl.into_parts();
        assert_eq!(transport.frames, 3);
        assert!(delay.calls.is_empty());
    }

    #[test]
    fn progress_follows_bytes_sent() {
        let mut bl = timed_bootloader(&[], Config::default().without_delays());
        let mut seen = Vec::new();
        // 16 data bytes still put a whole 128 byte page on the bus
        let records = [Ok::<_, HexError>(HexRecord::data(0x0000, vec![0x01; 16]))];
        Programmer::new(&mut bl)
            .with_expected_size(512)
            .upload(records, |p| seen.push(p))
            .unwrap();
        assert_eq!(seen, vec![100]);

        let records: Vec<Result<HexRecord, HexError>> = (0..4)
            .map(|i| Ok(HexRecord::data(i * 128, vec![0x02; 128])))
            .collect();
        let mut seen = Vec::new();
        Programmer::new(&mut bl)
            .with_expected_size(512)
            .upload(records, |p| seen.push(p))
            .unwrap();
        assert_eq!(seen, vec![50, 99, 100]);
    }

    fn collect_pages(records: &[HexRecord], page_size: usize, reserved: Range<u32>) -> (Vec<Page>, Pager) {
        let mut pager = Pager::new(page_size, reserved);
        let mut pages = Vec::new();
        let mut flush = |page: &Page| {
            pages.push(page.clone());
            Ok(())
        };
        for record in records {
            if pager.feed(record, &mut flush).unwrap() == Step::Stop {
                break;
            }
        }
        pager.finish(&mut flush).unwrap();
        (pages, pager)
    }

    #[test]
    fn fills_one_page() {
        let data: Vec<u8> = (0..128).map(|i| i as u8).collect();
        let records: Vec<_> = data
            .chunks(16)
            .enumerate()
            .map(|(i, c)| HexRecord::data(0x0100 + (i * 16) as u16, c.to_vec()))
            .collect();
        let (pages, pager) = collect_pages(&records, 128, 0x7C00..0x8000);
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].base, 0x0100);
        assert_eq!(pages[0].data, data);
        assert_eq!(pager.data_bytes, 128);
    }

    #[test]
    fn record_straddling_pages_splits() {
        let records = [HexRecord::data(0x007C, vec![1, 2, 3, 4, 5, 6, 7, 8])];
        let (pages, _) = collect_pages(&records, 128, 0x7C00..0x8000);
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].base, 0x0000);
        assert_eq!(&pages[0].data[0x7C..], &[1, 2, 3, 4]);
        assert!(pages[0].data[..0x7C].iter().all(|&b| b == 0xFF));
        assert_eq!(pages[1].base, 0x0080);
        assert_eq!(&pages[1].data[..4], &[5, 6, 7, 8]);
        assert!(pages[1].data[4..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn reserved_record_is_skipped() {
        let records = [
            HexRecord::data(0x0000, vec![0xAA; 4]),
            HexRecord::data(0x7C00, vec![0xBB; 16]),
        ];
        let (pages, pager) = collect_pages(&records, 128, 0x7C00..0x8000);
        assert_eq!(pages.len(), 1);
        assert_eq!(pager.reserved_records, 1);
        assert_eq!(pager.data_bytes, 4);
    }

    #[test]
    fn bytes_running_into_reserved_range_are_dropped() {
        let records = [HexRecord::data(0x7BF8, vec![0x11; 16])];
        let (pages, pager) = collect_pages(&records, 128, 0x7C00..0x8000);
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].base, 0x7B80);
        assert_eq!(pager.data_bytes, 8);
        assert_eq!(pager.reserved_bytes, 8);
    }

    #[test]
    fn extended_address_moves_records_out_of_reach() {
        let records = [
            HexRecord::extended_linear_address(0x0001),
            HexRecord::data(0x0000, vec![0x22; 4]),
        ];
        let (pages, pager) = collect_pages(&records, 128, 0x7C00..0x8000);
        assert!(pages.is_empty());
        assert_eq!(pager.rejected, 1);
    }

    #[test]
    fn stops_at_end_of_file() {
        let records = [
            HexRecord::end_of_file(),
            HexRecord::data(0x0000, vec![0x33; 4]),
        ];
        let (pages, pager) = collect_pages(&records, 128, 0x7C00..0x8000);
        assert!(pages.is_empty());
        assert_eq!(pager.data_bytes, 0);
    }

    #[test]
    fn runs_around_reserved_range() {
        assert_eq!(writable_runs(0x0000, 16, &(0x7C00..0x8000)), vec![0..16]);
        assert_eq!(writable_runs(0x7C00, 16, &(0x7C00..0x8000)), Vec::<Range<usize>>::new());
        assert_eq!(writable_runs(0x7BF8, 16, &(0x7C00..0x8000)), vec![0..8]);
        assert_eq!(writable_runs(0x0000, 16, &(0x0004..0x0008)), vec![0..4, 8..16]);
        assert_eq!(writable_runs(0x0000, 16, &(0x0000..0x0000)), vec![0..16]);
    }

    #[test]
    fn percent_is_capped_below_done() {
        assert_eq!(percent(0, 100), 0);
        assert_eq!(percent(50, 100), 50);
        assert_eq!(percent(500, 100), 99);
        assert_eq!(percent(10, 0), 99);
    }

    #[test]
    fn cancel_flag() {
        let flag = CancelFlag::new();
        let remote = flag.clone();
        assert!(!flag.should_cancel());
        remote.cancel();
        assert!(flag.should_cancel());
    }
}
