//! # Cardreader Core
//!
//! Single owner of the physical link. Sequences version negotiation, routes
//! inbound messages to the feature owning their endpoint, serializes outbound
//! frames onto the transport and drives protocol timers.
//!
//! ## Link States
//!
//! ```text
//!               plugged                 VersionInfo (ok)            ReaderInfo
//! Disconnected ─────────► Negotiating ───────────────► AwaitingReaderInfo ──────► Ready
//!      ▲                      │  │
//!      │   3 timeouts         │  └─ VersionInfo (update required) ──► Incompatible
//!      └──────────────────────┘                                     (fwup only)
//!
//!  unplugged (any state) ──► Disconnected, every feature gets on_link_down
//! ```
//!
//! ## Dispatch
//!
//! ```text
//! receive(bytes) ─► TransportBackend::unwrap_inbound ─► StagingBuffer
//!                                                          │
//!                                                    FrameDecoder
//!                                                          │
//!                       ┌─────────── endpoint == SYSTEM ───┤
//!                       ▼                                  ▼
//!                 link handshake                 Registry ─► feature.on_message
//!                                                          │
//!                                                 (none) ─► report_error
//! ```
//!
//! No core state is borrowed while a feature handler or a host callback
//! runs, so handlers may use core services and host callbacks may query.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use cardreader_shared::msgs::system::{
    CommsRate, ProtocolVersions, ReaderType, SystemEvent, SystemRequest,
};
use cardreader_shared::protocol::{
    DecoderStats, APP_VERSION, CRC_SIZE, ENDPOINT_VERSION, HEADER_SIZE, MIN_APP_VERSION,
    MIN_ENDPOINT_VERSION, MIN_TRANSPORT_VERSION, TRANSPORT_VERSION,
};
use cardreader_shared::{
    AppMessage, BufferStats, Capability, EndpointId, FrameDecoder, FrameEncoder, LinkConfig,
    Message, OverflowPolicy, SendStatus, StagingBuffer, TimerApi, TimerToken, TransportBackend,
};
use log::{debug, error, info, warn};

use crate::config::{
    CardreaderConfig, CommsVersionResult, ErrorReporter, FeatureFlag, FeatureFlags, HostFeature,
};
use crate::crypto::CryptoApi;
use crate::error::{CardreaderError, LifecycleError, Result};
use crate::guard::ReentrancyGuard;
use crate::lifecycle::Lifecycle;
use crate::registry::{EndpointHandler, Registry};

/// The version triple this library speaks
pub const PROTOCOL_VERSIONS: ProtocolVersions = ProtocolVersions {
    transport: TRANSPORT_VERSION,
    app: APP_VERSION,
    endpoint: ENDPOINT_VERSION,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Disconnected,
    Negotiating,
    AwaitingReaderInfo,
    Ready,
    Incompatible(CommsVersionResult),
}

#[derive(Debug, Default)]
struct PeerInfo {
    versions: Option<ProtocolVersions>,
    version_result: Option<CommsVersionResult>,
    reader_type: ReaderType,
    comms_rate_in: CommsRate,
    comms_rate_out: CommsRate,
    capabilities: Option<Vec<u16>>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Negotiation {
    attempts: u8,
    token: Option<TimerToken>,
}

/// Link counters for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStats {
    pub staging: BufferStats,
    pub decoder: DecoderStats,
    pub frames_sent: u64,
    pub frames_queued: usize,
    pub send_pending: bool,
}

/// Everything bound at init and released at term
struct Link {
    transport: Box<dyn TransportBackend>,
    timer: Box<dyn TimerApi>,
    flags: FeatureFlags,
    config: LinkConfig,
    state: LinkState,
    staging: Box<StagingBuffer>,
    decoder: FrameDecoder,
    encoder: FrameEncoder,
    tx_queue: VecDeque<Vec<u8>>,
    send_pending: bool,
    frames_sent: u64,
    timers: HashMap<TimerToken, EndpointId>,
    next_token: u32,
    negotiation: Negotiation,
    peer: PeerInfo,
}

impl Link {
    fn transmit(&mut self, frame: &[u8]) -> Result<()> {
        match self.transport.send(frame)? {
            SendStatus::Complete => {}
            SendStatus::Pending => self.send_pending = true,
        }
        self.frames_sent += 1;
        Ok(())
    }

    /// Drop everything tied to the current connection
    fn reset_connection(&mut self) {
        for token in self.timers.keys() {
            self.timer.stop(*token);
        }
        self.timers.clear();
        self.transport.close();
        self.staging.clear();
        self.decoder.reset();
        self.tx_queue.clear();
        self.send_pending = false;
        self.negotiation = Negotiation::default();
        self.peer = PeerInfo::default();
        self.state = LinkState::Disconnected;
    }
}

#[derive(Default)]
struct HostCallbacks {
    report_error: Option<ErrorReporter>,
    host_feature: Option<Box<dyn HostFeature>>,
}

pub(crate) struct Core {
    guard: ReentrancyGuard,
    lifecycle: Cell<Lifecycle>,
    link: RefCell<Option<Link>>,
    host: RefCell<HostCallbacks>,
    registry: RefCell<Registry>,
    crypto: RefCell<Option<Rc<dyn CryptoApi>>>,
}

fn compare_versions(peer: &ProtocolVersions) -> CommsVersionResult {
    if peer.transport < MIN_TRANSPORT_VERSION
        || peer.app < MIN_APP_VERSION
        || peer.endpoint < MIN_ENDPOINT_VERSION
    {
        CommsVersionResult::FirmwareUpdateRequired
    } else if peer.transport > TRANSPORT_VERSION || peer.app > APP_VERSION {
        CommsVersionResult::CardreaderUpdateRequired
    } else {
        CommsVersionResult::Ok
    }
}

impl Core {
    fn require_initialized(&self) -> Result<()> {
        self.lifecycle.get().require_initialized()?;
        Ok(())
    }

    fn with_link<R>(&self, f: impl FnOnce(&mut Link) -> R) -> Result<R> {
        let mut link = self.link.borrow_mut();
        link.as_mut()
            .map(f)
            .ok_or(CardreaderError::Lifecycle(LifecycleError::NotInitialized))
    }

    fn read_link<R: Default>(&self, f: impl FnOnce(&Link) -> R) -> R {
        match self.link.try_borrow() {
            Ok(link) => link.as_ref().map(f).unwrap_or_default(),
            Err(_) => R::default(),
        }
    }

    fn with_host(&self, f: impl FnOnce(&mut dyn HostFeature)) {
        if let Ok(mut host) = self.host.try_borrow_mut() {
            if let Some(feature) = host.host_feature.as_mut() {
                f(feature.as_mut());
            }
        }
    }

    pub(crate) fn report_error(&self, endpoint: EndpointId, msg: &str) {
        error!("{endpoint}: {msg}");
        if let Ok(mut host) = self.host.try_borrow_mut() {
            if let Some(report) = host.report_error.as_mut() {
                report(endpoint, msg);
            }
        }
    }

    /// Unexpected traffic from the reader
    pub(crate) fn reader_error(&self, endpoint: EndpointId, msg: &str) {
        self.with_host(|host| host.on_reader_error());
        self.report_error(endpoint, msg);
    }

    pub(crate) fn send(&self, msg: &Message) -> Result<()> {
        let mut guard = self.link.borrow_mut();
        let link = guard
            .as_mut()
            .ok_or(CardreaderError::Lifecycle(LifecycleError::NotInitialized))?;

        let negotiation_only =
            msg.endpoint == EndpointId::SYSTEM || msg.endpoint == EndpointId::FIRMWARE_UPDATE;
        match link.state {
            LinkState::Disconnected => return Err(CardreaderError::NotConnected),
            LinkState::Ready | LinkState::AwaitingReaderInfo => {}
            LinkState::Negotiating | LinkState::Incompatible(_) if negotiation_only => {}
            LinkState::Negotiating | LinkState::Incompatible(_) => {
                return Err(CardreaderError::ProtocolIncompatible)
            }
        }

        if link.send_pending && link.tx_queue.len() >= link.config.max_tx_queue {
            warn!("tx queue full; rejecting {} message {:#06x}", msg.endpoint, msg.msg_type);
            return Err(CardreaderError::SendBackpressure);
        }

        let mut frame = vec![0u8; HEADER_SIZE + msg.payload.len() + CRC_SIZE];
        link.encoder.encode(msg, &mut frame)?;
        debug!("tx {} type {:#06x} ({} bytes)", msg.endpoint, msg.msg_type, frame.len());

        if link.send_pending {
            link.tx_queue.push_back(frame);
            return Ok(());
        }
        link.transmit(&frame)
    }

    pub(crate) fn send_app<M: AppMessage>(&self, msg: &M) -> Result<()> {
        let message = msg.to_message()?;
        self.send(&message)
    }

    pub(crate) fn start_timer(&self, owner: EndpointId, delay_ms: u32) -> Result<TimerToken> {
        self.with_link(|link| {
            link.next_token = link.next_token.wrapping_add(1);
            let token = TimerToken(link.next_token);
            link.timers.insert(token, owner);
            link.timer.start(token, delay_ms);
            token
        })
    }

    pub(crate) fn stop_timer(&self, token: TimerToken) {
        let _ = self.with_link(|link| {
            if link.timers.remove(&token).is_some() {
                link.timer.stop(token);
            }
        });
    }

    pub(crate) fn capability_supported(&self, capability: Capability) -> bool {
        self.read_link(|link| {
            link.peer
                .capabilities
                .as_ref()
                .is_some_and(|caps| caps.contains(&capability.id()))
        })
    }

    fn is_reader_ready(&self) -> bool {
        self.read_link(|link| link.state == LinkState::Ready)
    }

    fn flags(&self) -> FeatureFlags {
        match self.link.try_borrow() {
            Ok(link) => link.as_ref().map(|l| l.flags).unwrap_or_default(),
            Err(_) => FeatureFlags::default(),
        }
    }

    fn drain_inbound(&self) {
        loop {
            let next = {
                let mut guard = self.link.borrow_mut();
                let Some(link) = guard.as_mut() else {
                    return;
                };
                link.decoder.next_message(&mut *link.staging)
            };
            match next {
                None => break,
                Some(Ok(msg)) => self.dispatch(&msg),
                Some(Err(err)) => warn!("dropping bad inbound frame: {err:?}"),
            }
        }
    }

    fn dispatch(&self, msg: &Message) {
        debug!("rx {} type {:#06x} ({} bytes)", msg.endpoint, msg.msg_type, msg.payload.len());
        if msg.endpoint == EndpointId::SYSTEM {
            self.handle_system(msg);
            return;
        }

        let handler = self.registry.borrow().get(msg.endpoint);
        match handler {
            Some(handler) => handler.on_message(msg),
            None => {
                warn!("no feature registered for {}", msg.endpoint);
                self.report_error(msg.endpoint, "message for unregistered endpoint");
            }
        }
    }

    fn handle_system(&self, msg: &Message) {
        let event = match SystemEvent::from_message(msg) {
            Ok(event) => event,
            Err(err) => {
                warn!("undecodable system message {:#06x}: {err:?}", msg.msg_type);
                self.reader_error(EndpointId::SYSTEM, "malformed system message");
                return;
            }
        };

        match event {
            SystemEvent::VersionInfo(versions) => self.on_version_info(versions),
            SystemEvent::ReaderInfo {
                reader_type,
                comms_rate_in,
                comms_rate_out,
            } => self.on_reader_info(reader_type, comms_rate_in, comms_rate_out),
            SystemEvent::Capabilities(list) => {
                info!("reader advertises {} capabilities", list.len());
                let _ = self.with_link(|link| link.peer.capabilities = Some(list.to_vec()));
            }
            SystemEvent::CapabilitiesUnsupported => {
                info!("reader does not support capability discovery");
                let _ = self.with_link(|link| link.peer.capabilities = Some(Vec::new()));
            }
        }
    }

    fn on_version_info(&self, versions: ProtocolVersions) {
        let outcome = self.with_link(|link| {
            if link.state != LinkState::Negotiating {
                return None;
            }
            if let Some(token) = link.negotiation.token.take() {
                link.timers.remove(&token);
                link.timer.stop(token);
            }
            let result = compare_versions(&versions);
            link.peer.versions = Some(versions);
            link.peer.version_result = Some(result);
            link.state = match result {
                CommsVersionResult::Ok => LinkState::AwaitingReaderInfo,
                other => LinkState::Incompatible(other),
            };
            Some(result)
        });

        let Ok(Some(result)) = outcome else {
            self.reader_error(EndpointId::SYSTEM, "unexpected version info");
            return;
        };

        info!(
            "comms versions acquired: transport {} app {} endpoint {} -> {result:?}",
            versions.transport, versions.app, versions.endpoint
        );
        self.with_host(|host| host.on_comms_version_acquired(result, versions));

        if result == CommsVersionResult::Ok {
            for query in [SystemRequest::ReaderInfoQuery, SystemRequest::CapabilitiesQuery] {
                if let Err(err) = self.send_app(&query) {
                    self.report_error(EndpointId::SYSTEM, &format!("handshake send failed: {err}"));
                }
            }
        }
    }

    fn on_reader_info(&self, reader_type: ReaderType, rate_in: CommsRate, rate_out: CommsRate) {
        let accepted = self.with_link(|link| {
            if link.state != LinkState::AwaitingReaderInfo {
                return false;
            }
            link.peer.reader_type = reader_type;
            link.peer.comms_rate_in = rate_in;
            link.peer.comms_rate_out = rate_out;
            link.state = LinkState::Ready;
            true
        });
        if accepted != Ok(true) {
            self.reader_error(EndpointId::SYSTEM, "unexpected reader info");
            return;
        }

        info!(
            "reader ready: {reader_type:?} (in {}, out {})",
            rate_in.name(),
            rate_out.name()
        );
        self.with_host(|host| host.on_reader_ready(reader_type));
        let features = self.registry.borrow().features();
        for feature in features {
            feature.on_reader_ready();
        }
    }

    fn send_version_query(&self) -> Result<()> {
        self.send_app(&SystemRequest::VersionQuery(PROTOCOL_VERSIONS))?;
        let delay = self.with_link(|link| link.config.negotiation_timeout_ms)?;
        let token = self.start_timer(EndpointId::SYSTEM, delay)?;
        self.with_link(|link| link.negotiation.token = Some(token))
    }

    fn on_negotiation_timeout(&self, token: TimerToken) {
        enum Next {
            Retry(u8),
            GiveUp,
            Stale,
        }

        let next = self.with_link(|link| {
            if link.state != LinkState::Negotiating || link.negotiation.token != Some(token) {
                return Next::Stale;
            }
            link.negotiation.token = None;
            if link.negotiation.attempts < link.config.max_negotiation_attempts {
                link.negotiation.attempts += 1;
                Next::Retry(link.negotiation.attempts)
            } else {
                link.reset_connection();
                Next::GiveUp
            }
        });

        match next {
            Ok(Next::Retry(attempt)) => {
                warn!("no version reply; retrying (attempt {attempt})");
                if let Err(err) = self.send_version_query() {
                    self.report_error(EndpointId::SYSTEM, &format!("version query failed: {err}"));
                }
            }
            Ok(Next::GiveUp) => {
                self.report_error(EndpointId::SYSTEM, "comms version negotiation timed out");
            }
            Ok(Next::Stale) | Err(_) => debug!("stale negotiation timer {token:?}"),
        }
    }
}

/// Non-owning handle features keep on their core
#[derive(Clone)]
pub(crate) struct CoreLink {
    core: Weak<Core>,
}

impl CoreLink {
    fn core(&self) -> Result<Rc<Core>> {
        self.core
            .upgrade()
            .ok_or(CardreaderError::Lifecycle(LifecycleError::Freed))
    }

    pub fn send<M: AppMessage>(&self, msg: &M) -> Result<()> {
        self.core()?.send_app(msg)
    }

    pub fn start_timer(&self, owner: EndpointId, delay_ms: u32) -> Result<TimerToken> {
        self.core()?.start_timer(owner, delay_ms)
    }

    pub fn stop_timer(&self, token: TimerToken) {
        if let Ok(core) = self.core() {
            core.stop_timer(token);
        }
    }

    pub fn report_error(&self, endpoint: EndpointId, msg: &str) {
        match self.core() {
            Ok(core) => core.report_error(endpoint, msg),
            Err(_) => error!("{endpoint}: {msg}"),
        }
    }

    pub fn reader_error(&self, endpoint: EndpointId, msg: &str) {
        match self.core() {
            Ok(core) => core.reader_error(endpoint, msg),
            Err(_) => error!("{endpoint}: {msg}"),
        }
    }

    pub fn capability_supported(&self, capability: Capability) -> bool {
        self.core().is_ok_and(|core| core.capability_supported(capability))
    }

    pub fn is_reader_ready(&self) -> bool {
        self.core().is_ok_and(|core| core.is_reader_ready())
    }

    pub fn feature_flags(&self) -> FeatureFlags {
        self.core().map(|core| core.flags()).unwrap_or_default()
    }

    pub fn crypto(&self) -> Option<Rc<dyn CryptoApi>> {
        let core = self.core().ok()?;
        let crypto = core.crypto.borrow().clone();
        crypto
    }

    pub fn register(&self, endpoints: &[EndpointId], handler: Rc<dyn EndpointHandler>) -> Result<()> {
        let core = self.core()?;
        core.require_initialized()?;
        let mut registry = core.registry.borrow_mut();
        for (i, endpoint) in endpoints.iter().enumerate() {
            if let Err(err) = registry.register(*endpoint, Rc::clone(&handler)) {
                for done in &endpoints[..i] {
                    let _ = registry.deregister(*done);
                }
                return Err(err);
            }
            debug!("registered {endpoint}");
        }
        Ok(())
    }

    pub fn deregister(&self, endpoints: &[EndpointId]) {
        let Ok(core) = self.core() else {
            return;
        };
        let Ok(mut registry) = core.registry.try_borrow_mut() else {
            error!("registry busy; cannot deregister {endpoints:?}");
            return;
        };
        for endpoint in endpoints {
            if registry.deregister(*endpoint).is_ok() {
                debug!("deregistered {endpoint}");
            }
        }
    }
}

/// The reader communications core
///
/// One instance per physical reader connection. Follows the four-phase
/// [`Lifecycle`]; a terminated core cannot be initialized again.
pub struct Cardreader {
    core: Rc<Core>,
}

impl Cardreader {
    /// Reserve a core. No side effects.
    pub fn alloc() -> Self {
        Self {
            core: Rc::new(Core {
                guard: ReentrancyGuard::new(),
                lifecycle: Cell::new(Lifecycle::Allocated),
                link: RefCell::new(None),
                host: RefCell::new(HostCallbacks::default()),
                registry: RefCell::new(Registry::default()),
                crypto: RefCell::new(None),
            }),
        }
    }

    /// Bind transport, timer, error reporter and optional host feature
    ///
    /// No timer is started here; timers only run once a reader is plugged.
    pub fn init(&mut self, config: CardreaderConfig) -> Result<()> {
        let _scope = self.core.guard.enter("cardreader_init")?;
        let mut lifecycle = self.core.lifecycle.get();
        lifecycle.init("cardreader", false)?;

        *self.core.link.borrow_mut() = Some(Link {
            transport: config.transport,
            timer: config.timer,
            flags: config.feature_flags,
            config: config.link,
            state: LinkState::Disconnected,
            staging: Box::new(StagingBuffer::new(OverflowPolicy::DropNew)),
            decoder: FrameDecoder::new(),
            encoder: FrameEncoder::new(),
            tx_queue: VecDeque::new(),
            send_pending: false,
            frames_sent: 0,
            timers: HashMap::new(),
            next_token: 0,
            negotiation: Negotiation::default(),
            peer: PeerInfo::default(),
        });
        *self.core.host.borrow_mut() = HostCallbacks {
            report_error: Some(config.report_error),
            host_feature: config.host_feature,
        };
        self.core.lifecycle.set(lifecycle);
        info!(
            "cardreader initialized (transport {} app {} endpoint {})",
            TRANSPORT_VERSION, APP_VERSION, ENDPOINT_VERSION
        );
        Ok(())
    }

    /// Stop timers and detach the transport
    ///
    /// Every feature must be terminated first; otherwise this fails with
    /// [`CardreaderError::FeaturesStillRegistered`] and nothing changes.
    pub fn term(&mut self) -> Result<()> {
        let _scope = self.core.guard.enter("cardreader_term")?;
        let mut lifecycle = self.core.lifecycle.get();
        lifecycle.require_initialized().or_else(|err| match lifecycle {
            Lifecycle::Terminated => Err(LifecycleError::AlreadyTerminated),
            _ => Err(err),
        })?;

        let registered = self.core.registry.borrow().feature_count();
        if registered > 0 {
            warn!("cardreader term refused: {registered} feature(s) still registered");
            return Err(CardreaderError::FeaturesStillRegistered(registered));
        }

        if let Some(mut link) = self.core.link.borrow_mut().take() {
            link.reset_connection();
        }
        *self.core.host.borrow_mut() = HostCallbacks::default();
        lifecycle.term("cardreader")?;
        self.core.lifecycle.set(lifecycle);
        Ok(())
    }

    /// Release the core; it must be terminated (or never initialized)
    pub fn free(&mut self) -> Result<()> {
        let _scope = self.core.guard.enter("cardreader_free")?;
        let mut lifecycle = self.core.lifecycle.get();
        lifecycle.free("cardreader")?;
        self.core.lifecycle.set(lifecycle);
        *self.core.crypto.borrow_mut() = None;
        Ok(())
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.core.lifecycle.get()
    }

    /// Install the crypto API used to seal data for the reader
    pub fn set_crypto_api(&self, crypto: Rc<dyn CryptoApi>) -> Result<()> {
        let _scope = self.core.guard.enter("cardreader_set_crypto_api")?;
        *self.core.crypto.borrow_mut() = Some(crypto);
        Ok(())
    }

    /// A reader was connected; opens the transport and starts negotiation
    pub fn notify_reader_plugged(&self) -> Result<()> {
        let _scope = self.core.guard.enter("cardreader_notify_reader_plugged")?;
        self.core.require_initialized()?;

        let opened = self.core.with_link(|link| {
            if link.state != LinkState::Disconnected {
                return Ok(false);
            }
            link.transport.open()?;
            link.staging.clear();
            link.decoder.reset();
            link.negotiation = Negotiation {
                attempts: 1,
                token: None,
            };
            link.state = LinkState::Negotiating;
            Ok::<_, CardreaderError>(true)
        })??;
        if !opened {
            warn!("reader plugged while already connected; ignored");
            return Ok(());
        }

        info!("reader plugged; negotiating comms version");
        if let Err(err) = self.core.send_version_query() {
            let _ = self.core.with_link(Link::reset_connection);
            return Err(err);
        }
        Ok(())
    }

    /// The reader went away; aborts everything outstanding
    pub fn notify_reader_unplugged(&self) -> Result<()> {
        let _scope = self.core.guard.enter("cardreader_notify_reader_unplugged")?;
        self.core.require_initialized()?;

        let was_connected = self.core.with_link(|link| {
            if link.state == LinkState::Disconnected {
                return false;
            }
            link.reset_connection();
            true
        })?;
        if !was_connected {
            debug!("unplug while disconnected; ignored");
            return Ok(());
        }

        info!("reader unplugged");
        let features = self.core.registry.borrow().features();
        for feature in features {
            feature.on_link_down();
        }
        self.core.report_error(EndpointId::SYSTEM, "reader disconnected");
        Ok(())
    }

    /// Bytes the host received from the transport
    pub fn receive(&self, bytes: &[u8]) -> Result<()> {
        let _scope = self.core.guard.enter("cardreader_receive")?;
        self.core.require_initialized()?;

        let staged = self.core.with_link(|link| {
            if link.state == LinkState::Disconnected {
                return Err(CardreaderError::NotConnected);
            }
            link.transport
                .unwrap_inbound(bytes, &mut link.staging)
                .map_err(CardreaderError::from)
        })?;

        if let Err(err) = staged {
            warn!("inbound bytes dropped: {err}");
        }
        self.core.drain_inbound();
        staged.map(|_| ())
    }

    /// A send that returned [`SendStatus::Pending`] has finished
    pub fn notify_send_complete(&self) -> Result<()> {
        let _scope = self.core.guard.enter("cardreader_notify_send_complete")?;
        self.core.require_initialized()?;

        self.core.with_link(|link| {
            if !link.send_pending {
                debug!("send complete with nothing pending");
                return Ok(());
            }
            link.send_pending = false;
            while !link.send_pending {
                let Some(frame) = link.tx_queue.pop_front() else {
                    break;
                };
                link.transmit(&frame)?;
            }
            Ok(())
        })?
    }

    /// A timer started through [`TimerApi::start`] elapsed
    pub fn notify_timer_expired(&self, token: TimerToken) -> Result<()> {
        let _scope = self.core.guard.enter("cardreader_notify_timer_expired")?;
        self.core.require_initialized()?;

        let owner = self.core.with_link(|link| link.timers.remove(&token))?;
        match owner {
            None => debug!("timer {token:?} expired with no owner; dropped"),
            Some(EndpointId::SYSTEM) => self.core.on_negotiation_timeout(token),
            Some(endpoint) => {
                let handler = self.core.registry.borrow().get(endpoint);
                match handler {
                    Some(handler) => handler.on_timer(token),
                    None => debug!("timer {token:?} for deregistered {endpoint}; dropped"),
                }
            }
        }
        Ok(())
    }

    /// The version triple this library implements
    pub fn protocol_versions() -> ProtocolVersions {
        PROTOCOL_VERSIONS
    }

    /// Versions reported by the reader, once negotiation has answered
    pub fn peer_versions(&self) -> Option<ProtocolVersions> {
        self.core.read_link(|link| link.peer.versions)
    }

    pub fn comms_version_result(&self) -> Option<CommsVersionResult> {
        self.core.read_link(|link| link.peer.version_result)
    }

    pub fn reader_type(&self) -> ReaderType {
        self.core.read_link(|link| link.peer.reader_type)
    }

    pub fn comms_rates(&self) -> (CommsRate, CommsRate) {
        self.core
            .read_link(|link| (link.peer.comms_rate_in, link.peer.comms_rate_out))
    }

    pub fn is_reader_ready(&self) -> bool {
        self.core.is_reader_ready()
    }

    pub fn is_connected(&self) -> bool {
        self.core
            .read_link(|link| link.state != LinkState::Disconnected)
    }

    /// Whether the reader's capability list (or its absence) is known
    pub fn capabilities_complete(&self) -> bool {
        self.core.read_link(|link| link.peer.capabilities.is_some())
    }

    /// Pure lookup; false for unknown or not yet reported capabilities
    pub fn capability_supported(&self, capability: Capability) -> bool {
        self.core.capability_supported(capability)
    }

    /// Raw capability ids as reported, empty until complete
    pub fn capabilities(&self) -> Vec<u16> {
        self.core
            .read_link(|link| link.peer.capabilities.clone().unwrap_or_default())
    }

    /// Whether a feature currently owns `endpoint`
    pub fn is_feature_enabled(&self, endpoint: EndpointId) -> bool {
        self.core
            .registry
            .try_borrow()
            .is_ok_and(|registry| registry.contains(endpoint))
    }

    pub fn feature_flag(&self, flag: FeatureFlag) -> bool {
        self.core.flags().get(flag)
    }

    pub fn comms_rate_name(rate: CommsRate) -> &'static str {
        rate.name()
    }

    pub fn link_stats(&self) -> Option<LinkStats> {
        self.core.read_link(|link| {
            Some(LinkStats {
                staging: link.staging.stats(),
                decoder: link.decoder.stats(),
                frames_sent: link.frames_sent,
                frames_queued: link.tx_queue.len(),
                send_pending: link.send_pending,
            })
        })
    }

    pub(crate) fn link(&self) -> CoreLink {
        CoreLink {
            core: Rc::downgrade(&self.core),
        }
    }

    pub(crate) fn guard(&self) -> ReentrancyGuard {
        self.core.guard.clone()
    }
}

impl Drop for Cardreader {
    fn drop(&mut self) {
        if self.core.lifecycle.get().is_initialized() {
            warn!("cardreader dropped while initialized; closing transport");
            if let Ok(mut link) = self.core.link.try_borrow_mut() {
                if let Some(link) = link.as_mut() {
                    link.reset_connection();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use cardreader_shared::msgs::power::PowerRequest;

    #[test]
    fn test_version_comparison() {
        let ours = PROTOCOL_VERSIONS;
        assert_eq!(compare_versions(&ours), CommsVersionResult::Ok);

        let old = ProtocolVersions {
            transport: MIN_TRANSPORT_VERSION - 1,
            ..ours
        };
        assert_eq!(compare_versions(&old), CommsVersionResult::FirmwareUpdateRequired);

        let newer = ProtocolVersions {
            app: APP_VERSION + 1,
            ..ours
        };
        assert_eq!(compare_versions(&newer), CommsVersionResult::CardreaderUpdateRequired);
    }

    #[test]
    fn test_lifecycle_errors() {
        let mut reader = Cardreader::alloc();
        assert_eq!(
            reader.notify_reader_plugged(),
            Err(CardreaderError::Lifecycle(LifecycleError::NotInitialized))
        );
        assert_eq!(
            reader.term(),
            Err(CardreaderError::Lifecycle(LifecycleError::NotInitialized))
        );

        let harness = Harness::new();
        reader.init(harness.config()).unwrap();
        assert_eq!(
            reader.init(harness.config()),
            Err(CardreaderError::Lifecycle(LifecycleError::AlreadyInitialized))
        );
        assert_eq!(
            reader.free(),
            Err(CardreaderError::Lifecycle(LifecycleError::NotTerminated))
        );
        reader.term().unwrap();
        assert_eq!(
            reader.term(),
            Err(CardreaderError::Lifecycle(LifecycleError::AlreadyTerminated))
        );
        assert_eq!(
            reader.init(harness.config()),
            Err(CardreaderError::Lifecycle(LifecycleError::AlreadyTerminated))
        );
        reader.free().unwrap();
    }

    #[test]
    fn test_plug_sends_version_query_and_starts_timer() {
        let harness = Harness::new();
        let reader = harness.init_reader();
        reader.notify_reader_plugged().unwrap();

        let sent = harness.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            SystemRequest::from_message(&sent[0]).unwrap(),
            SystemRequest::VersionQuery(PROTOCOL_VERSIONS)
        );
        assert_eq!(harness.running_timers().len(), 1);
        assert!(harness.transport_open());
    }

    #[test]
    fn test_negotiation_gives_up_after_three_attempts() {
        let harness = Harness::new();
        let reader = harness.init_reader();
        reader.notify_reader_plugged().unwrap();

        for _ in 0..3 {
            assert!(harness.fire_next_timer(&reader));
        }

        assert_eq!(harness.sent_messages().len(), 3);
        assert!(!reader.is_connected());
        assert!(harness
            .errors()
            .contains(&(EndpointId::SYSTEM, "comms version negotiation timed out".into())));
    }

    #[test]
    fn test_handshake_reaches_ready() {
        let harness = Harness::new();
        let reader = harness.ready_reader();
        assert!(reader.is_reader_ready());
        assert_eq!(reader.reader_type(), ReaderType::R12);
        assert_eq!(reader.peer_versions(), Some(PROTOCOL_VERSIONS));
        assert!(harness.running_timers().is_empty());
        assert!(reader.capabilities_complete());
        assert!(reader.capability_supported(Capability::PinBlockFormat4));
        assert!(!reader.capability_supported(Capability::Tmn));
    }

    #[test]
    fn test_incompatible_reader_only_allows_fwup() {
        let harness = Harness::new();
        let reader = harness.init_reader();
        reader.notify_reader_plugged().unwrap();
        harness.feed(
            &reader,
            &SystemEvent::VersionInfo(ProtocolVersions {
                transport: 1,
                app: 1,
                endpoint: 1,
            }),
        );
        assert_eq!(
            reader.comms_version_result(),
            Some(CommsVersionResult::FirmwareUpdateRequired)
        );

        let link = reader.link();
        assert_eq!(
            link.send(&PowerRequest::GetBatteryVoltage),
            Err(CardreaderError::ProtocolIncompatible)
        );
        assert!(link
            .send(&cardreader_shared::msgs::firmware_update::FirmwareUpdateRequest::GetManifest)
            .is_ok());
    }

    #[test]
    fn test_unmatched_endpoint_reported() {
        let harness = Harness::new();
        let reader = harness.ready_reader();
        harness.feed(&reader, &cardreader_shared::msgs::power::PowerEvent::ResetAck);
        assert!(harness
            .errors()
            .contains(&(EndpointId::POWER, "message for unregistered endpoint".into())));
    }

    #[test]
    fn test_pending_sends_queue_with_backpressure() {
        let harness = Harness::new();
        let reader = harness.ready_reader();
        harness.set_pending(true);
        let link = reader.link();

        // First send goes out and leaves the transport busy
        link.send(&PowerRequest::Reset).unwrap();
        for _ in 0..LinkConfig::default().max_tx_queue {
            link.send(&PowerRequest::Reset).unwrap();
        }
        assert_eq!(link.send(&PowerRequest::Reset), Err(CardreaderError::SendBackpressure));

        let before = harness.sent_messages().len();
        harness.set_pending(false);
        reader.notify_send_complete().unwrap();
        let after = harness.sent_messages().len();
        assert_eq!(after - before, LinkConfig::default().max_tx_queue);
        assert_eq!(reader.link_stats().map(|s| s.frames_queued), Some(0));
    }

    #[test]
    fn test_unplug_resets_and_reports_once() {
        let harness = Harness::new();
        let reader = harness.ready_reader();
        reader.notify_reader_unplugged().unwrap();
        reader.notify_reader_unplugged().unwrap();

        assert!(!reader.is_reader_ready());
        assert!(!reader.capabilities_complete());
        assert_eq!(reader.peer_versions(), None);
        assert!(!harness.transport_open());
        let losses = harness
            .errors()
            .iter()
            .filter(|(_, msg)| msg == "reader disconnected")
            .count();
        assert_eq!(losses, 1);
        assert_eq!(reader.receive(&[0u8; 4]), Err(CardreaderError::NotConnected));
    }

    #[test]
    fn test_host_callback_cannot_reenter() {
        let harness = Harness::new();
        let reader = harness.init_reader();
        let guard = reader.guard();
        let _scope = guard.enter("simulated callback").unwrap();
        assert_eq!(reader.notify_reader_plugged(), Err(CardreaderError::Reentrant));
    }
}
