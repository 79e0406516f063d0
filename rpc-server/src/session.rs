//! One client's reader session.
//!
//! The core's transport, timer and host callbacks all write into a shared
//! outbox. After each request the outbox is drained into the response, so the
//! client sees every side effect of the request it just made.

use std::cell::RefCell;
use std::convert::Infallible;
use std::rc::Rc;

use cardreader::backend::{UartBackend, UsbHidBackend, UsbHidConfig};
use cardreader::shared::msgs::system::{ProtocolVersions, ReaderType};
use cardreader::shared::{SendStatus, TimerApi, TimerToken, TransportBackend};
use cardreader::{Cardreader, CardreaderConfig, CommsVersionResult, HostFeature};
use log::{debug, info, warn};
use serde_json::json;

use crate::config::{BackendKind, ServerConfig};
use crate::error::RpcError;
use crate::protocol::{RpcRequest, RpcResponse, RpcStatus, TimerRequest};

/// Hooks into the secure processor next to the reader, when the host has one
pub trait SeeApi {
    fn send_cmd(&mut self, command: &[u8]) -> Result<Vec<u8>, RpcError>;

    fn reset_spe(&mut self) -> Result<(), RpcError> {
        Err(RpcError::HookUnavailable("reset_spe"))
    }
}

#[derive(Default)]
struct Outbox {
    to_reader: Vec<Vec<u8>>,
    timers: Vec<TimerRequest>,
    events: Vec<String>,
}

type SharedOutbox = Rc<RefCell<Outbox>>;

struct OutboxTimer(SharedOutbox);

impl TimerApi for OutboxTimer {
    fn start(&mut self, token: TimerToken, delay_ms: u32) {
        self.0.borrow_mut().timers.push(TimerRequest::Start {
            token: token.0,
            delay_ms,
        });
    }

    fn stop(&mut self, token: TimerToken) {
        self.0
            .borrow_mut()
            .timers
            .push(TimerRequest::Stop { token: token.0 });
    }
}

/// UART side of the outbox
struct OutboxPort(SharedOutbox);

impl embedded_io::ErrorType for OutboxPort {
    type Error = Infallible;
}

impl embedded_io::Write for OutboxPort {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.0.borrow_mut().to_reader.push(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

struct OutboxHost(SharedOutbox);

impl HostFeature for OutboxHost {
    fn on_reader_ready(&mut self, reader_type: ReaderType) {
        self.0
            .borrow_mut()
            .events
            .push(format!("reader ready: {reader_type:?}"));
    }

    fn on_reader_error(&mut self) {
        self.0.borrow_mut().events.push("reader error".into());
    }

    fn on_comms_version_acquired(&mut self, result: CommsVersionResult, v: ProtocolVersions) {
        self.0.borrow_mut().events.push(format!(
            "comms version {result:?} ({}.{}.{})",
            v.transport, v.app, v.endpoint
        ));
    }
}

pub struct Session {
    backend: BackendKind,
    report_size: usize,
    outbox: SharedOutbox,
    reader: Option<Cardreader>,
    see: Option<Box<dyn SeeApi>>,
    requests: u64,
}

impl Session {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            backend: config.backend,
            report_size: config.report_size,
            outbox: Rc::new(RefCell::new(Outbox::default())),
            reader: None,
            see: None,
            requests: 0,
        }
    }

    pub fn with_see_api(mut self, see: Box<dyn SeeApi>) -> Self {
        self.see = Some(see);
        self
    }

    /// Run one request and collect everything it caused
    pub fn handle(&mut self, request: RpcRequest) -> RpcResponse {
        self.requests += 1;
        debug!("rpc request {request:?}");
        let result = self.dispatch(request);
        let outbox = std::mem::take(&mut *self.outbox.borrow_mut());
        let (status, body) = match result {
            Ok(body) => (RpcStatus::Ok, body),
            Err(err) => {
                warn!("rpc request failed: {err}");
                (RpcStatus::Failed(err.to_string()), Vec::new())
            }
        };
        RpcResponse {
            status,
            to_reader: outbox.to_reader,
            timers: outbox.timers,
            events: outbox.events,
            body,
        }
    }

    fn reader(&self) -> Result<&Cardreader, RpcError> {
        self.reader.as_ref().ok_or(RpcError::NoSession)
    }

    fn see(&mut self, hook: &'static str) -> Result<&mut Box<dyn SeeApi>, RpcError> {
        self.see.as_mut().ok_or(RpcError::HookUnavailable(hook))
    }

    fn transport(&self, kind: BackendKind) -> Result<Box<dyn TransportBackend>, RpcError> {
        let outbox = Rc::clone(&self.outbox);
        Ok(match kind {
            BackendKind::Usb => Box::new(UsbHidBackend::new(
                UsbHidConfig {
                    report_size: self.report_size,
                },
                Box::new(move |reports| {
                    outbox.borrow_mut().to_reader.push(reports.to_vec());
                    Ok(SendStatus::Complete)
                }),
            )?),
            BackendKind::Uart => Box::new(UartBackend::new(OutboxPort(outbox))),
        })
    }

    fn create(&mut self, backend: Option<BackendKind>) -> Result<(), RpcError> {
        if self.reader.is_some() {
            return Err(RpcError::SessionExists);
        }
        let kind = backend.unwrap_or(self.backend);
        let errors = Rc::clone(&self.outbox);
        let config = CardreaderConfig::new(
            self.transport(kind)?,
            Box::new(OutboxTimer(Rc::clone(&self.outbox))),
            Box::new(move |endpoint, msg| {
                errors
                    .borrow_mut()
                    .events
                    .push(format!("error {endpoint}: {msg}"));
            }),
        )
        .with_host_feature(Box::new(OutboxHost(Rc::clone(&self.outbox))));

        let mut reader = Cardreader::alloc();
        reader.init(config)?;
        info!("reader session created over {kind:?}");
        self.reader = Some(reader);
        Ok(())
    }

    fn destroy(&mut self) -> Result<(), RpcError> {
        let reader = self.reader.as_mut().ok_or(RpcError::NoSession)?;
        reader.term()?;
        reader.free()?;
        self.reader = None;
        info!("reader session destroyed");
        Ok(())
    }

    fn stats(&self) -> Result<Vec<u8>, RpcError> {
        let mut stats = json!({
            "session": self.reader.is_some(),
            "requests": self.requests,
        });
        if let Some(reader) = &self.reader {
            stats["connected"] = json!(reader.is_connected());
            stats["ready"] = json!(reader.is_reader_ready());
            stats["reader_type"] = json!(format!("{:?}", reader.reader_type()));
            if let Some(link) = reader.link_stats() {
                stats["frames_sent"] = json!(link.frames_sent);
                stats["frames_queued"] = json!(link.frames_queued);
                stats["send_pending"] = json!(link.send_pending);
                stats["rx_overflows"] = json!(link.staging.overflows);
                stats["crc_errors"] = json!(link.decoder.crc_errors);
            }
        }
        Ok(serde_json::to_vec(&stats)?)
    }

    fn dispatch(&mut self, request: RpcRequest) -> Result<Vec<u8>, RpcError> {
        match request {
            RpcRequest::Create { backend } => self.create(backend)?,
            RpcRequest::Destroy => self.destroy()?,
            RpcRequest::Plugged => self.reader()?.notify_reader_plugged()?,
            RpcRequest::Unplugged => self.reader()?.notify_reader_unplugged()?,
            RpcRequest::FromReader(bytes) => self.reader()?.receive(&bytes)?,
            RpcRequest::TimerExpired(token) => {
                self.reader()?.notify_timer_expired(TimerToken(token))?
            }
            RpcRequest::SendComplete => self.reader()?.notify_send_complete()?,
            RpcRequest::SeeCommand(command) => return self.see("send_cmd")?.send_cmd(&command),
            RpcRequest::ResetSpe => self.see("reset_spe")?.reset_spe()?,
            RpcRequest::Stats => return self.stats(),
        }
        Ok(Vec::new())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            debug!("client left without Destroy");
            if reader.term().is_ok() {
                let _ = reader.free();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoSee;

    impl SeeApi for EchoSee {
        fn send_cmd(&mut self, command: &[u8]) -> Result<Vec<u8>, RpcError> {
            Ok(command.iter().rev().copied().collect())
        }
    }

    fn session(kind: BackendKind) -> Session {
        let mut session = Session::new(&ServerConfig::default());
        let created = session.handle(RpcRequest::Create {
            backend: Some(kind),
        });
        assert!(created.is_ok());
        session
    }

    #[test]
    fn test_requests_need_a_session() {
        let mut session = Session::new(&ServerConfig::default());
        let response = session.handle(RpcRequest::Plugged);
        assert!(!response.is_ok());
    }

    #[test]
    fn test_create_twice_fails() {
        let mut session = session(BackendKind::Usb);
        let again = session.handle(RpcRequest::Create { backend: None });
        assert_eq!(
            again.status,
            RpcStatus::Failed(RpcError::SessionExists.to_string())
        );
    }

    #[test]
    fn test_plugged_over_usb_emits_reports_and_timer() {
        let mut session = session(BackendKind::Usb);
        let response = session.handle(RpcRequest::Plugged);
        assert!(response.is_ok());
        assert_eq!(response.to_reader.len(), 1);
        assert_eq!(response.to_reader[0].len() % 64, 0);
        assert!(matches!(response.timers[..], [TimerRequest::Start { delay_ms: 500, .. }]));
    }

    #[test]
    fn test_negotiation_timeout_reported_as_event() {
        let mut session = session(BackendKind::Uart);
        let mut response = session.handle(RpcRequest::Plugged);
        for _ in 0..3 {
            let token = match response.timers.last() {
                Some(TimerRequest::Start { token, .. }) => *token,
                other => panic!("expected a timer start, got {other:?}"),
            };
            response = session.handle(RpcRequest::TimerExpired(token));
            assert!(response.is_ok());
        }
        assert!(response.events.iter().any(|e| e.starts_with("error system")));
    }

    #[test]
    fn test_see_hooks() {
        let mut session = session(BackendKind::Usb);
        assert!(!session.handle(RpcRequest::SeeCommand(vec![1])).is_ok());

        let mut session = Session::new(&ServerConfig::default()).with_see_api(Box::new(EchoSee));
        let response = session.handle(RpcRequest::SeeCommand(vec![1, 2, 3]));
        assert_eq!(response.body, vec![3, 2, 1]);
        assert!(!session.handle(RpcRequest::ResetSpe).is_ok());
    }

    #[test]
    fn test_stats_and_destroy() {
        let mut session = session(BackendKind::Usb);
        session.handle(RpcRequest::Plugged);
        let response = session.handle(RpcRequest::Stats);
        let stats: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(stats["session"], true);
        assert_eq!(stats["connected"], true);
        assert_eq!(stats["frames_sent"], 1);

        assert!(session.handle(RpcRequest::Destroy).is_ok());
        assert!(!session.handle(RpcRequest::Destroy).is_ok());
    }
}
