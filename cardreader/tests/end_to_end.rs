//! Full stack tests: core plus features over the USB HID backend, with a
//! simulated reader on the other end of the reports.

use std::cell::RefCell;
use std::rc::Rc;

use cardreader::backend::{UsbHidBackend, UsbHidConfig};
use cardreader::features::payment::{Payment, PaymentCompletion, PaymentEvents, PaymentTiming};
use cardreader::features::power::{Power, PowerEvents};
use cardreader::shared::msgs::payment::{
    AccountType, CardInfo, EmvEvent, EmvRequest, MagswipeEvent, PaymentResult, PaymentSource,
    Timestamp, TmnResult, TransactionType,
};
use cardreader::shared::msgs::power::{BatteryMode, BatteryStatus, PowerEvent, PowerRequest};
use cardreader::shared::msgs::system::{
    CommsRate, ProtocolVersions, ReaderType, SystemEvent, SystemRequest,
};
use cardreader::shared::{
    AppMessage, Capability, EndpointId, FrameDecoder, FrameEncoder, Message, OverflowPolicy,
    SendStatus, StagingBuffer, TimerApi, TimerToken, MAX_FRAME_SIZE,
};
use cardreader::{
    Cardreader, CardreaderConfig, CardreaderError, CommsVersionResult, HostFeature, PaymentConfig,
    PROTOCOL_VERSIONS,
};

const REPORT_SIZE: usize = 64;

#[derive(Default)]
struct Wire {
    outbound: Vec<u8>,
    timers: Vec<TimerToken>,
    errors: Vec<(EndpointId, String)>,
    host: Vec<String>,
}

type Shared = Rc<RefCell<Wire>>;

struct Timer(Shared);

impl TimerApi for Timer {
    fn start(&mut self, token: TimerToken, _delay_ms: u32) {
        self.0.borrow_mut().timers.push(token);
    }

    fn stop(&mut self, token: TimerToken) {
        self.0.borrow_mut().timers.retain(|t| *t != token);
    }
}

struct Host(Shared);

impl HostFeature for Host {
    fn on_reader_ready(&mut self, reader_type: ReaderType) {
        self.0.borrow_mut().host.push(format!("ready {reader_type:?}"));
    }

    fn on_reader_error(&mut self) {
        self.0.borrow_mut().host.push("reader error".into());
    }

    fn on_comms_version_acquired(&mut self, result: CommsVersionResult, v: ProtocolVersions) {
        self.0.borrow_mut().host.push(format!(
            "versions {result:?} {}.{}.{}",
            v.transport, v.app, v.endpoint
        ));
    }
}

/// The reader side of the link
struct SimReader {
    wire: Shared,
    encoder: FrameEncoder,
}

impl SimReader {
    fn new() -> Self {
        Self {
            wire: Rc::new(RefCell::new(Wire::default())),
            encoder: FrameEncoder::new(),
        }
    }

    fn config(&self) -> CardreaderConfig {
        let sink = Rc::clone(&self.wire);
        let backend = UsbHidBackend::new(
            UsbHidConfig {
                report_size: REPORT_SIZE,
            },
            Box::new(move |reports| {
                sink.borrow_mut().outbound.extend_from_slice(reports);
                Ok(SendStatus::Complete)
            }),
        )
        .unwrap();
        let errors = Rc::clone(&self.wire);
        CardreaderConfig::new(
            Box::new(backend),
            Box::new(Timer(Rc::clone(&self.wire))),
            Box::new(move |endpoint, msg| {
                errors.borrow_mut().errors.push((endpoint, msg.to_string()));
            }),
        )
        .with_host_feature(Box::new(Host(Rc::clone(&self.wire))))
    }

    fn reader(&self) -> Cardreader {
        let mut reader = Cardreader::alloc();
        reader.init(self.config()).unwrap();
        reader
    }

    /// Pack one message into zero padded HID reports and deliver it
    fn feed<M: AppMessage>(&mut self, reader: &Cardreader, msg: &M) {
        let mut frame = [0u8; MAX_FRAME_SIZE];
        let len = self
            .encoder
            .encode(&msg.to_message().unwrap(), &mut frame)
            .unwrap();
        let mut reports = Vec::new();
        for chunk in frame[..len].chunks(REPORT_SIZE - 1) {
            let mut report = vec![0u8; REPORT_SIZE];
            report[0] = chunk.len() as u8;
            report[1..=chunk.len()].copy_from_slice(chunk);
            reports.extend_from_slice(&report);
        }
        reader.receive(&reports).unwrap();
    }

    /// Everything the host sent since the last call, unpacked and decoded
    fn drain(&self) -> Vec<Message> {
        let raw = std::mem::take(&mut self.wire.borrow_mut().outbound);
        let mut ring = StagingBuffer::new(OverflowPolicy::DropNew);
        for report in raw.chunks(REPORT_SIZE) {
            let len = usize::from(report[0]);
            ring.insert(&report[1..=len]);
        }
        let mut decoder = FrameDecoder::new();
        let mut messages = Vec::new();
        while let Some(msg) = decoder.next_message(&mut ring) {
            messages.push(msg.unwrap());
        }
        messages
    }

    fn handshake(&mut self, reader: &Cardreader) {
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
        let caps = [Capability::PowerLpsTimeout, Capability::PowerupHint]
            .iter()
            .map(|c| c.id())
            .collect();
        self.feed(reader, &SystemEvent::Capabilities(caps));
        self.drain();
    }

    fn errors(&self) -> Vec<(EndpointId, String)> {
        self.wire.borrow().errors.clone()
    }
}

#[derive(Clone, Default)]
struct Log(Rc<RefCell<Vec<String>>>);

impl Log {
    fn push(&self, entry: String) {
        self.0.borrow_mut().push(entry);
    }

    fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }
}

struct PowerLog(Log);

impl PowerEvents for PowerLog {
    fn on_battery_voltage_response(&mut self, status: BatteryStatus) {
        self.0.push(format!("battery {}%", status.charge_percentage));
    }
}

struct PaymentLog {
    log: Log,
    completions: Rc<RefCell<Vec<PaymentCompletion>>>,
}

impl PaymentEvents for PaymentLog {
    fn on_payment_complete(&mut self, completion: &PaymentCompletion) {
        self.log.push(format!("complete {:?}", completion.result));
        self.completions.borrow_mut().push(completion.clone());
    }

    fn on_tmn_transaction_complete(&mut self, result: TmnResult, _timings: &[PaymentTiming]) {
        self.log.push(format!("tmn {result:?}"));
    }

    fn on_card_action_required(
        &mut self,
        action: cardreader::shared::msgs::payment::CardAction,
        _std_msg: cardreader::shared::msgs::payment::StdMsg,
    ) {
        self.log.push(format!("action {action:?}"));
    }
}

fn battery() -> BatteryStatus {
    BatteryStatus {
        charge_percentage: 64,
        current: 0,
        voltage: 3800,
        temperature: 21,
        is_critical: false,
        mode: BatteryMode::Discharging,
    }
}

#[test]
fn test_handshake_and_power_over_usb_hid() {
    let mut sim = SimReader::new();
    let reader = sim.reader();

    reader.notify_reader_plugged().unwrap();
    let sent = sim.drain();
    assert!(matches!(
        SystemRequest::from_message(&sent[0]),
        Ok(SystemRequest::VersionQuery(_))
    ));

    sim.feed(&reader, &SystemEvent::VersionInfo(PROTOCOL_VERSIONS));
    sim.feed(
        &reader,
        &SystemEvent::ReaderInfo {
            reader_type: ReaderType::R12,
            comms_rate_in: CommsRate::default(),
            comms_rate_out: CommsRate::default(),
        },
    );
    sim.feed(&reader, &SystemEvent::CapabilitiesUnsupported);
    assert!(reader.is_reader_ready());
    assert!(reader.capabilities_complete());
    assert_eq!(
        sim.wire.borrow().host,
        vec![
            format!(
                "versions Ok {}.{}.{}",
                PROTOCOL_VERSIONS.transport, PROTOCOL_VERSIONS.app, PROTOCOL_VERSIONS.endpoint
            ),
            "ready R12".to_string(),
        ]
    );
    assert_eq!(reader.peer_versions(), Some(PROTOCOL_VERSIONS));
    sim.drain();

    let log = Log::default();
    let mut power = Power::alloc();
    power.init(&reader, Box::new(PowerLog(log.clone()))).unwrap();
    power.get_battery_voltage().unwrap();
    let sent = sim.drain();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        PowerRequest::from_message(&sent[0]).unwrap(),
        PowerRequest::GetBatteryVoltage
    );

    sim.feed(&reader, &PowerEvent::BatteryVoltage(battery()));
    assert_eq!(log.entries(), vec!["battery 64%"]);
    assert!(sim.errors().is_empty());
}

#[test]
fn test_core_term_waits_for_features() {
    let mut sim = SimReader::new();
    let mut reader = sim.reader();
    sim.handshake(&reader);

    let mut power = Power::alloc();
    power.init(&reader, Box::new(PowerLog(Log::default()))).unwrap();
    assert_eq!(reader.term(), Err(CardreaderError::FeaturesStillRegistered(1)));

    power.term().unwrap();
    sim.feed(&reader, &PowerEvent::ResetAck);
    assert_eq!(sim.errors().len(), 1);
    assert_eq!(sim.errors()[0].0, EndpointId::POWER);

    reader.term().unwrap();
    power.free().unwrap();
    reader.free().unwrap();
}

#[test]
fn test_chip_failures_fall_back_to_swipe() {
    let mut sim = SimReader::new();
    let reader = sim.reader();
    sim.handshake(&reader);

    let log = Log::default();
    let completions = Rc::new(RefCell::new(Vec::new()));
    let mut payment = Payment::alloc();
    payment
        .init(
            &reader,
            Box::new(PaymentLog {
                log: log.clone(),
                completions: Rc::clone(&completions),
            }),
            PaymentConfig::default(),
        )
        .unwrap();

    payment
        .start_payment(
            2500,
            AccountType::Default,
            TransactionType::Purchase,
            Timestamp::new(24, 11, 3, 9, 15, 0),
        )
        .unwrap();
    let sent = sim.drain();
    assert!(matches!(
        EmvRequest::from_message(&sent[0]),
        Ok(EmvRequest::Start(start)) if start.amount == 2500
    ));

    for _ in 0..3 {
        sim.feed(&reader, &EmvEvent::IccPowerFailure);
    }
    sim.feed(
        &reader,
        &MagswipeEvent::Swipe {
            data: heapless::Vec::from_slice(&[0x5B; 40]).unwrap(),
            card_info: CardInfo::default(),
            has_icc: true,
            source: PaymentSource::Msr0,
        },
    );

    assert_eq!(
        log.entries(),
        vec![
            "action InsertAgain",
            "action InsertAgain",
            "action SwipeTechnical",
            "complete MagswipeTechnicalFallback"
        ]
    );
    let completion = &completions.borrow()[0];
    assert_eq!(completion.data, vec![0x5B; 40]);
    assert_eq!(completion.timings[0].label.as_str(), "start");
    assert_eq!(completion.timings.last().map(|t| t.label.as_str()), Some("complete"));
}

#[test]
fn test_unplug_mid_payment_then_replug() {
    let mut sim = SimReader::new();
    let reader = sim.reader();
    sim.handshake(&reader);

    let log = Log::default();
    let mut payment = Payment::alloc();
    payment
        .init(
            &reader,
            Box::new(PaymentLog {
                log: log.clone(),
                completions: Rc::default(),
            }),
            PaymentConfig::default(),
        )
        .unwrap();
    payment
        .get_card_info(Timestamp::new(24, 11, 3, 9, 15, 0))
        .unwrap();

    reader.notify_reader_unplugged().unwrap();
    assert_eq!(log.entries(), vec!["complete Terminated"]);
    assert_eq!(sim.errors().len(), 1);
    assert!(!reader.is_reader_ready());

    sim.handshake(&reader);
    assert!(reader.is_reader_ready());
    assert!(reader.capability_supported(Capability::PowerupHint));
    payment.send_powerup_hint(10).unwrap();
    assert_eq!(
        EmvRequest::from_message(&sim.drain()[0]).unwrap(),
        EmvRequest::PowerupHint { timeout_seconds: 10 }
    );
}
