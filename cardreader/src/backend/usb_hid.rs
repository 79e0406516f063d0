//! USB HID link packaging.
//!
//! Every report has the same size. The first byte holds the number of payload
//! bytes that follow; the rest of the report is zero padded. A frame larger
//! than one report is split over several.

use cardreader_shared::{
    SendStatus, StagingBuffer, TransportBackend, TransportError, TransportResult,
};
use log::{debug, warn};

use crate::error::CardreaderError;

/// Report size of the full speed HID interface
pub const DEFAULT_REPORT_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbHidConfig {
    pub report_size: usize,
}

impl Default for UsbHidConfig {
    fn default() -> Self {
        Self {
            report_size: DEFAULT_REPORT_SIZE,
        }
    }
}

/// Hands a run of packed reports to the host's HID stack
pub type ReportWriter = Box<dyn FnMut(&[u8]) -> TransportResult<SendStatus>>;

pub struct UsbHidBackend {
    config: UsbHidConfig,
    writer: ReportWriter,
    open: bool,
    packed: Vec<u8>,
}

impl UsbHidBackend {
    /// Reports need room for the length byte and at least one payload byte
    pub fn new(config: UsbHidConfig, writer: ReportWriter) -> Result<Self, CardreaderError> {
        if config.report_size < 2 || config.report_size > usize::from(u8::MAX) + 1 {
            return Err(CardreaderError::InvalidParameter);
        }
        Ok(Self {
            config,
            writer,
            open: false,
            packed: Vec::new(),
        })
    }

    pub fn config(&self) -> UsbHidConfig {
        self.config
    }

    fn payload_per_report(&self) -> usize {
        self.config.report_size - 1
    }

    /// Split `bytes` into zero padded reports
    fn pack(&mut self, bytes: &[u8]) {
        let report_size = self.config.report_size;
        let chunk_size = self.payload_per_report();
        self.packed.clear();
        for chunk in bytes.chunks(chunk_size) {
            let start = self.packed.len();
            self.packed.resize(start + report_size, 0);
            // chunk_size < 256 so the length always fits
            self.packed[start] = chunk.len() as u8;
            self.packed[start + 1..start + 1 + chunk.len()].copy_from_slice(chunk);
        }
    }
}

impl TransportBackend for UsbHidBackend {
    fn open(&mut self) -> TransportResult<()> {
        debug!("usb hid open ({} byte reports)", self.config.report_size);
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
        self.packed.clear();
    }

    fn send(&mut self, bytes: &[u8]) -> TransportResult<SendStatus> {
        if !self.open {
            return Err(TransportError::Disconnected);
        }
        self.pack(bytes);
        (self.writer)(&self.packed)
    }

    fn unwrap_inbound(&mut self, raw: &[u8], staging: &mut StagingBuffer) -> TransportResult<usize> {
        let report_size = self.config.report_size;
        if raw.is_empty() || raw.len() % report_size != 0 {
            warn!("usb hid: {} bytes is not a whole number of reports", raw.len());
            return Err(TransportError::MalformedPacket);
        }
        let limit = self.payload_per_report();
        if raw
            .chunks(report_size)
            .any(|report| usize::from(report[0]) > limit)
        {
            warn!("usb hid: report length byte out of range");
            return Err(TransportError::MalformedPacket);
        }

        let mut staged = 0;
        for report in raw.chunks(report_size) {
            let len = usize::from(report[0]);
            let payload = &report[1..1 + len];
            if staging.insert(payload) < payload.len() {
                return Err(TransportError::BufferOverflow);
            }
            staged += len;
        }
        Ok(staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardreader_shared::OverflowPolicy;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn backend(report_size: usize) -> (UsbHidBackend, Rc<RefCell<Vec<Vec<u8>>>>) {
        let written = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&written);
        let backend = UsbHidBackend::new(
            UsbHidConfig { report_size },
            Box::new(move |reports| {
                sink.borrow_mut().push(reports.to_vec());
                Ok(SendStatus::Complete)
            }),
        )
        .unwrap();
        (backend, written)
    }

    #[test]
    fn test_rejects_tiny_reports() {
        let writer: ReportWriter = Box::new(|_| Ok(SendStatus::Complete));
        assert!(matches!(
            UsbHidBackend::new(UsbHidConfig { report_size: 1 }, writer),
            Err(CardreaderError::InvalidParameter)
        ));
    }

    #[test]
    fn test_send_splits_and_pads() {
        let (mut hid, written) = backend(8);
        assert_eq!(hid.send(&[1, 2, 3]), Err(TransportError::Disconnected));
        hid.open().unwrap();

        let frame: Vec<u8> = (1..=10).collect();
        assert_eq!(hid.send(&frame), Ok(SendStatus::Complete));
        let reports = written.borrow();
        assert_eq!(
            reports[0],
            vec![7, 1, 2, 3, 4, 5, 6, 7, 3, 8, 9, 10, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_inbound_reassembles_reports() {
        let (mut hid, _written) = backend(8);
        let mut ring = StagingBuffer::new(OverflowPolicy::DropNew);
        let raw = [7, 1, 2, 3, 4, 5, 6, 7, 2, 8, 9, 0, 0, 0, 0, 0];
        assert_eq!(hid.unwrap_inbound(&raw, &mut ring), Ok(9));
        assert_eq!(ring.data(9), Some(&[1, 2, 3, 4, 5, 6, 7, 8, 9][..]));
    }

    #[test]
    fn test_inbound_malformed() {
        let (mut hid, _written) = backend(8);
        let mut ring = StagingBuffer::new(OverflowPolicy::DropNew);
        assert_eq!(
            hid.unwrap_inbound(&[1, 2, 3], &mut ring),
            Err(TransportError::MalformedPacket)
        );
        assert_eq!(
            hid.unwrap_inbound(&[8, 0, 0, 0, 0, 0, 0, 0], &mut ring),
            Err(TransportError::MalformedPacket)
        );
        assert!(ring.is_empty());
    }
}
