//! Configuration and policy constants.

use cardreader_shared::msgs::system::{ProtocolVersions, ReaderType};
use cardreader_shared::{EndpointId, LinkConfig, TimerApi, TransportBackend};

/// Consecutive chip power failures before falling back to magswipe
pub const MAX_ICC_FAILURES: u8 = 3;
/// Identical swipes within this window are reported once
pub const MAGSWIPE_DUPLICATE_TIMEOUT_MS: u64 = 4_000;
/// How long a PIN entry window stays open
pub const PIN_ENTRY_TIMEOUT_MS: u32 = 60_000;
/// Timing breadcrumbs kept per transaction
pub const MAX_TIMINGS: usize = 16;
/// Longest timing label
pub const TIMING_LABEL_SIZE: usize = 16;
/// ISO 4217 US dollar
pub const DEFAULT_CURRENCY_CODE: u16 = 840;

/// Outcome of link version negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommsVersionResult {
    /// All features behave normally
    Ok,
    /// The reader speaks a newer protocol than this library
    CardreaderUpdateRequired,
    /// The reader's firmware is too old; only firmware update works
    FirmwareUpdateRequired,
}

/// Callbacks for the integrating application itself
///
/// All methods default to no-ops.
pub trait HostFeature {
    /// Initial handshake finished; reader operations are now allowed
    fn on_reader_ready(&mut self, _reader_type: ReaderType) {}

    /// The reader sent something nobody asked for
    fn on_reader_error(&mut self) {}

    fn on_comms_version_acquired(&mut self, _result: CommsVersionResult, _versions: ProtocolVersions) {}
}

/// Receives every error the core or a feature reports, tagged by endpoint
pub type ErrorReporter = Box<dyn FnMut(EndpointId, &str)>;

/// Process-wide switches read once at core init
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureFlags {
    /// Allow ISO format 4 pinblocks when the reader supports them
    pub pinblock_format_4: bool,
    /// Allow TMN e-money transactions
    pub tmn: bool,
    /// Drop identical magswipes that arrive back to back
    pub swipe_duplicate_suppression: bool,
    /// Open a PIN entry timeout window on every PIN request
    pub pin_entry_timeout: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            pinblock_format_4: true,
            tmn: false,
            swipe_duplicate_suppression: true,
            pin_entry_timeout: true,
        }
    }
}

/// Names a single entry of [`FeatureFlags`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureFlag {
    PinBlockFormat4,
    Tmn,
    SwipeDuplicateSuppression,
    PinEntryTimeout,
}

impl FeatureFlags {
    pub fn get(&self, flag: FeatureFlag) -> bool {
        match flag {
            FeatureFlag::PinBlockFormat4 => self.pinblock_format_4,
            FeatureFlag::Tmn => self.tmn,
            FeatureFlag::SwipeDuplicateSuppression => self.swipe_duplicate_suppression,
            FeatureFlag::PinEntryTimeout => self.pin_entry_timeout,
        }
    }
}

/// Everything the core binds at init
pub struct CardreaderConfig {
    pub transport: Box<dyn TransportBackend>,
    pub timer: Box<dyn TimerApi>,
    pub report_error: ErrorReporter,
    pub host_feature: Option<Box<dyn HostFeature>>,
    pub feature_flags: FeatureFlags,
    pub link: LinkConfig,
}

impl CardreaderConfig {
    /// Config with default flags and link timing and no host feature
    pub fn new(
        transport: Box<dyn TransportBackend>,
        timer: Box<dyn TimerApi>,
        report_error: ErrorReporter,
    ) -> Self {
        Self {
            transport,
            timer,
            report_error,
            host_feature: None,
            feature_flags: FeatureFlags::default(),
            link: LinkConfig::default(),
        }
    }

    pub fn with_host_feature(mut self, host: Box<dyn HostFeature>) -> Self {
        self.host_feature = Some(host);
        self
    }

    pub fn with_feature_flags(mut self, flags: FeatureFlags) -> Self {
        self.feature_flags = flags;
        self
    }
}

/// Merchant settings for the payment feature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentConfig {
    /// Merchant category code
    pub mcc: u16,
    /// ISO 4217 numeric code
    pub transaction_currency_code: u16,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            mcc: 0,
            transaction_currency_code: DEFAULT_CURRENCY_CODE,
        }
    }
}
