//! # Transport Backends
//!
//! Ready-made [`TransportBackend`](cardreader_shared::TransportBackend)
//! implementations for the two physical links readers ship with.
//!
//! ```text
//!   frame bytes ─► UsbHidBackend ─► [len|payload|0-pad] × n ─► report writer
//!   frame bytes ─► UartBackend   ─► embedded_io::Write (raw stream)
//! ```
//!
//! Inbound data goes the other way through `unwrap_inbound`: HID reports are
//! unpacked and reassembled into the staging ring, UART bytes are staged as is.

mod uart;
mod usb_hid;

pub use uart::UartBackend;
pub use usb_hid::{ReportWriter, UsbHidBackend, UsbHidConfig, DEFAULT_REPORT_SIZE};
