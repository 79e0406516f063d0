//! Raw byte stream over a UART. Frames go out unchanged and inbound bytes are
//! staged as they arrive, so the default `unwrap_inbound` applies.

use cardreader_shared::{SendStatus, TransportBackend, TransportError, TransportResult};
use embedded_io::Write;
use log::{debug, warn};

pub struct UartBackend<W: Write> {
    port: W,
    open: bool,
}

impl<W: Write> UartBackend<W> {
    pub fn new(port: W) -> Self {
        Self { port, open: false }
    }

    pub fn port(&self) -> &W {
        &self.port
    }
}

impl<W: Write> TransportBackend for UartBackend<W> {
    fn open(&mut self) -> TransportResult<()> {
        debug!("uart open");
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn send(&mut self, bytes: &[u8]) -> TransportResult<SendStatus> {
        if !self.open {
            return Err(TransportError::Disconnected);
        }
        self.port.write_all(bytes).map_err(|err| {
            warn!("uart write failed: {err:?}");
            TransportError::IoError
        })?;
        self.port.flush().map_err(|_| TransportError::IoError)?;
        Ok(SendStatus::Complete)
    }
}
