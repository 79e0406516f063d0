//! Simulated reader for unit tests: a recording transport, a manual timer and
//! helpers that drive the core through its handshake.

use std::cell::RefCell;
use std::rc::Rc;

use cardreader_shared::msgs::system::{CommsRate, ProtocolVersions, ReaderType, SystemEvent};
use cardreader_shared::{
    AppMessage, Capability, EndpointId, FrameDecoder, FrameEncoder, Message, OverflowPolicy,
    SendStatus, StagingBuffer, TimerApi, TimerToken, TransportBackend, TransportResult,
    MAX_FRAME_SIZE,
};

use crate::config::{CardreaderConfig, CommsVersionResult, FeatureFlags, HostFeature};
use crate::reader::{Cardreader, PROTOCOL_VERSIONS};

#[derive(Default)]
pub(crate) struct SimState {
    pub frames: Vec<Vec<u8>>,
    pub open: bool,
    pub pending: bool,
    pub timers: Vec<(TimerToken, u32)>,
    pub errors: Vec<(EndpointId, String)>,
    pub host_events: Vec<String>,
}

struct SimTransport(Rc<RefCell<SimState>>);

impl TransportBackend for SimTransport {
    fn open(&mut self) -> TransportResult<()> {
        self.0.borrow_mut().open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.0.borrow_mut().open = false;
    }

    fn send(&mut self, bytes: &[u8]) -> TransportResult<SendStatus> {
        let mut state = self.0.borrow_mut();
        state.frames.push(bytes.to_vec());
        Ok(if state.pending {
            SendStatus::Pending
        } else {
            SendStatus::Complete
        })
    }
}

struct SimTimer(Rc<RefCell<SimState>>);

impl TimerApi for SimTimer {
    fn start(&mut self, token: TimerToken, delay_ms: u32) {
        let mut state = self.0.borrow_mut();
        state.timers.retain(|(t, _)| *t != token);
        state.timers.push((token, delay_ms));
    }

    fn stop(&mut self, token: TimerToken) {
        self.0.borrow_mut().timers.retain(|(t, _)| *t != token);
    }
}

struct SimHost(Rc<RefCell<SimState>>);

impl HostFeature for SimHost {
    fn on_reader_ready(&mut self, reader_type: ReaderType) {
        self.0
            .borrow_mut()
            .host_events
            .push(format!("ready {reader_type:?}"));
    }

    fn on_reader_error(&mut self) {
        self.0.borrow_mut().host_events.push("reader error".into());
    }

    fn on_comms_version_acquired(&mut self, result: CommsVersionResult, v: ProtocolVersions) {
        self.0.borrow_mut().host_events.push(format!(
            "versions {result:?} {}.{}.{}",
            v.transport, v.app, v.endpoint
        ));
    }
}

pub(crate) struct Harness {
    pub state: Rc<RefCell<SimState>>,
    encoder: RefCell<FrameEncoder>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(SimState::default())),
            encoder: RefCell::new(FrameEncoder::new()),
        }
    }

    pub fn config(&self) -> CardreaderConfig {
        let errors = Rc::clone(&self.state);
        CardreaderConfig::new(
            Box::new(SimTransport(Rc::clone(&self.state))),
            Box::new(SimTimer(Rc::clone(&self.state))),
            Box::new(move |endpoint, msg| {
                errors.borrow_mut().errors.push((endpoint, msg.to_string()));
            }),
        )
        .with_host_feature(Box::new(SimHost(Rc::clone(&self.state))))
    }

    pub fn init_reader(&self) -> Cardreader {
        self.init_reader_with(FeatureFlags::default())
    }

    pub fn init_reader_with(&self, flags: FeatureFlags) -> Cardreader {
        let mut reader = Cardreader::alloc();
        reader
            .init(self.config().with_feature_flags(flags))
            .unwrap();
        reader
    }

    /// Plug and answer the handshake with the default capability set
    pub fn handshake(&self, reader: &Cardreader, capabilities: &[Capability]) {
        reader.notify_reader_plugged().unwrap();
        self.feed(reader, &SystemEvent::VersionInfo(PROTOCOL_VERSIONS));
        self.feed(
            reader,
            &SystemEvent::ReaderInfo {
                reader_type: ReaderType::R12,
                comms_rate_in: CommsRate::default(),
                comms_rate_out: CommsRate::default(),
            },
        );
        let ids = capabilities.iter().map(|c| c.id()).collect();
        self.feed(reader, &SystemEvent::Capabilities(ids));
        self.clear_sent();
    }

    pub fn ready_reader(&self) -> Cardreader {
        let reader = self.init_reader();
        self.handshake(&reader, &default_capabilities());
        reader
    }

    pub fn feed<M: AppMessage>(&self, reader: &Cardreader, msg: &M) {
        let message = msg.to_message().unwrap();
        self.feed_raw(reader, &message);
    }

    pub fn feed_raw(&self, reader: &Cardreader, message: &Message) {
        let mut frame = [0u8; MAX_FRAME_SIZE];
        let len = self
            .encoder
            .borrow_mut()
            .encode(message, &mut frame)
            .unwrap();
        reader.receive(&frame[..len]).unwrap();
    }

    pub fn sent_messages(&self) -> Vec<Message> {
        let state = self.state.borrow();
        state
            .frames
            .iter()
            .map(|frame| {
                let mut ring = StagingBuffer::new(OverflowPolicy::DropNew);
                ring.insert(frame);
                FrameDecoder::new().next_message(&mut ring).unwrap().unwrap()
            })
            .collect()
    }

    /// Outbound messages for `M`'s endpoint, decoded
    pub fn sent<M: AppMessage>(&self) -> Vec<M> {
        self.sent_messages()
            .iter()
            .filter(|msg| msg.endpoint == M::ENDPOINT)
            .map(|msg| M::from_message(msg).unwrap())
            .collect()
    }

    pub fn clear_sent(&self) {
        self.state.borrow_mut().frames.clear();
    }

    pub fn running_timers(&self) -> Vec<TimerToken> {
        self.state.borrow().timers.iter().map(|(t, _)| *t).collect()
    }

    /// Expire the oldest running timer; false if none is running
    pub fn fire_next_timer(&self, reader: &Cardreader) -> bool {
        let next = {
            let mut state = self.state.borrow_mut();
            if state.timers.is_empty() {
                None
            } else {
                Some(state.timers.remove(0).0)
            }
        };
        match next {
            Some(token) => {
                reader.notify_timer_expired(token).unwrap();
                true
            }
            None => false,
        }
    }

    pub fn errors(&self) -> Vec<(EndpointId, String)> {
        self.state.borrow().errors.clone()
    }

    pub fn host_events(&self) -> Vec<String> {
        self.state.borrow().host_events.clone()
    }

    pub fn set_pending(&self, pending: bool) {
        self.state.borrow_mut().pending = pending;
    }

    pub fn transport_open(&self) -> bool {
        self.state.borrow().open
    }
}

pub(crate) fn default_capabilities() -> Vec<Capability> {
    vec![
        Capability::PinBlockFormat4,
        Capability::EventLogNumParam,
        Capability::PowerLpsTimeout,
        Capability::PowerupHint,
    ]
}

/// Shared recording of callback names, for event trait mocks
#[derive(Clone, Default)]
pub(crate) struct Recorder(pub Rc<RefCell<Vec<String>>>);

impl Recorder {
    pub fn push(&self, event: impl Into<String>) {
        self.0.borrow_mut().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.borrow().clone()
    }

    pub fn contains(&self, event: &str) -> bool {
        self.0.borrow().iter().any(|e| e == event)
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }
}
