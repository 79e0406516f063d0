//! Payment endpoints: EMV flow, magnetic stripe and TMN e-money.
//!
//! Payment owns three endpoints at once. The card data types in this file are
//! also used by the secure session endpoint when asking for a PIN.

use heapless::{String, Vec};
use serde::{Deserialize, Serialize};

use crate::protocol::{AppMessage, EndpointId};

pub const ADF_NAME_MAX: usize = 16;
pub const APP_LABEL_MAX: usize = 16;
pub const APP_PREFNAME_MAX: usize = 16;
pub const LAST4_LENGTH: usize = 4;
pub const NAME_MAX_LENGTH: usize = 26;
pub const ACCOUNT_TYPE_MAX: usize = 6;
pub const MAX_APPLICATIONS: usize = 8;
pub const LANGUAGE_PREFS: usize = 4;
/// Opaque payment server payloads (ARQC, ARPC, clearing data)
pub const MAX_PAYMENT_BLOB: usize = 512;
pub const MAX_SWIPE_DATA: usize = 256;
pub const TMN_TRANSACTION_ID_LEN: usize = 32;
pub const TMN_MAX_DISPLAY_STRING: usize = 32;
pub const TMN_MAX_MIRYO_DATA: usize = 256;
pub const MERCHANT_LOYALTY_ID_LEN: usize = 32;
pub const MAX_LOYALTY_IDS: usize = 3;
pub const LOYALTY_URL_MAX: usize = 64;
pub const MAX_VAS_DATA: usize = 256;
pub const NDEF_MERCHANT_ID_MAX: usize = 16;
pub const NDEF_CARD_ID_MAX: usize = 80;
pub const MSR_DUMP_MAX: usize = 256;

/// Card brand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IssuerId {
    #[default]
    Unknown,
    Visa,
    Mastercard,
    Amex,
    Discover,
    DiscoverDiners,
    Jcb,
    UnionPay,
    Interac,
    Eftpos,
    Felica,
}

/// Cardholder verification method that was performed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CvmPerformed {
    Failed,
    OfflinePlaintextPin,
    OnlineEncipheredPin,
    OfflinePlaintextPinAndSignature,
    OfflineEncipheredPin,
    OfflineEncipheredPinAndSignature,
    OnDevice,
    Signature,
    None,
    #[default]
    Unknown,
}

pub const TRACK_NONE: u8 = 0;
pub const TRACK_ONE: u8 = 1 << 0;
pub const TRACK_TWO: u8 = 1 << 1;
pub const TRACK_THREE: u8 = 1 << 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PaymentApplication {
    /// Printed on receipts
    pub adf_name: Vec<u8, ADF_NAME_MAX>,
    pub label: String<APP_LABEL_MAX>,
    pub preferred_name: String<APP_PREFNAME_MAX>,
    pub icode_table_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CardInfo {
    pub issuer: IssuerId,
    pub last4: String<LAST4_LENGTH>,
    pub name: String<NAME_MAX_LENGTH>,
    /// Ignored for magswipe
    pub application: PaymentApplication,
    /// `TRACK_*` bits read successfully
    pub track_bitmask: u8,
    pub cvm_performed: CvmPerformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CardPresence {
    #[default]
    Unknown,
    NotPresent,
    Present,
}

/// What the cardholder must do next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CardAction {
    None,
    Insert,
    InsertAgain,
    SwipeTechnical,
    SwipeScheme,
    SwipeAgain,
    InsertFromContactless,
    ContactlessTryAnotherCard,
    ContactlessTryAgain,
    ContactlessSeePhone,
    ContactlessPresentOnlyOne,
    ContactlessUnlockPhone,
    ContactlessLimitExceededTryAnotherCard,
    ContactlessLimitExceededInsertCard,
    RequestTap,
    IssuerRequestedPresentCardAgain,
}

/// Standard message id the UI layer turns into displayable copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StdMsg {
    #[default]
    None,
    Amount,
    AmountOk,
    Approved,
    CallYourBank,
    CancelOrEnter,
    CardError,
    Declined,
    EnterAmount,
    EnterPin,
    IncorrectPin,
    InsertCard,
    NotAccepted,
    PinOk,
    PleaseWait,
    ProcessingError,
    RemoveCard,
    UseChipReader,
    UseMagStripe,
    TryAgain,
    SeePhone,
    PresentCardAgain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AccountType {
    #[default]
    Default,
    Savings,
    Checking,
    Credit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransactionType {
    #[default]
    Purchase,
    Cash,
    Refund,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransactionMode {
    #[default]
    Payment,
    CardInfo,
    EcpVasOrPayment,
    EcpVasAndPayment,
    EcpVasOnly,
    EcpPaymentOnly,
    EcpVasAndPaymentSq,
    StoreAndForwardPayment,
}

pub type MerchantLoyaltyId = [u8; MERCHANT_LOYALTY_ID_LEN];

/// How the wallet answered a value-added-services request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VasProtocol {
    Url,
    Full,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LoyaltyResult {
    Success,
    VasDataNotFound,
    Canceled,
    Terminated,
    Skipped,
    UrlPushFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NdefApplicationType {
    TeamManagement,
    Loyalty,
    GiftCard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NdefResult {
    Success,
    NoCard,
    ReadError,
    WriteError,
    AlreadyWritten,
    Terminated,
}

/// Where a payment ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PaymentResult {
    SuccessIccApprove,
    SuccessIccApproveWithSignature,
    SuccessContactlessApprove,
    SuccessContactlessApproveWithSignature,
    TerminatedIccDecline,
    TerminatedContactlessDecline,
    TerminatedIccReversal,
    TerminatedContactlessReversal,
    Terminated,
    Canceled,
    Magswipe,
    MagswipeTechnicalFallback,
    MagswipeSchemeFallback,
    CardInfoComplete,
    Timeout,
}

impl PaymentResult {
    pub const fn is_success(self) -> bool {
        matches!(
            self,
            Self::SuccessIccApprove
                | Self::SuccessIccApproveWithSignature
                | Self::SuccessContactlessApprove
                | Self::SuccessContactlessApproveWithSignature
                | Self::Magswipe
                | Self::MagswipeTechnicalFallback
                | Self::MagswipeSchemeFallback
        )
    }
}

/// Wall clock supplied by the caller, broken down the way the reader wants it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timestamp {
    /// Years since 2000
    pub year: u8,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl Timestamp {
    pub const fn new(year: u8, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Self {
        Self {
            year,
            month,
            day,
            hour,
            minute,
            second,
        }
    }

    pub const fn is_valid(&self) -> bool {
        self.month >= 1
            && self.month <= 12
            && self.day >= 1
            && self.day <= 31
            && self.hour <= 23
            && self.minute <= 59
            && self.second <= 59
    }
}

/// Magnetic stripe head a swipe came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PaymentSource {
    #[default]
    Default,
    Msr0,
    Msr1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StartPayment {
    pub amount: u32,
    pub currency_code: u16,
    pub mcc: u16,
    pub account_type: AccountType,
    pub transaction_type: TransactionType,
    pub mode: TransactionMode,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmvRequest {
    Start(StartPayment),
    Cancel,
    SelectApplication(Vec<u8, ADF_NAME_MAX>),
    SelectAccountType(AccountType),
    AuthorizationResponse(Vec<u8, MAX_PAYMENT_BLOB>),
    RequestCardPresence,
    PowerupHint { timeout_seconds: u32 },
    SetLoyaltyUrl {
        merchant_loyalty_id: MerchantLoyaltyId,
        url: String<LOYALTY_URL_MAX>,
    },
    SetLoyaltyVas(Vec<MerchantLoyaltyId, MAX_LOYALTY_IDS>),
    GetVasData,
    ReadNdef {
        application_type: NdefApplicationType,
        merchant_id: Vec<u8, NDEF_MERCHANT_ID_MAX>,
    },
    WriteNdef {
        application_type: NdefApplicationType,
        merchant_id: Vec<u8, NDEF_MERCHANT_ID_MAX>,
        card_id: Vec<u8, NDEF_CARD_ID_MAX>,
        card_type: u8,
        override_existing: bool,
    },
}

impl AppMessage for EmvRequest {
    const ENDPOINT: EndpointId = EndpointId::EMV_FLOW;

    fn msg_type(&self) -> u16 {
        match self {
            Self::Start(_) => 0x01,
            Self::Cancel => 0x02,
            Self::SelectApplication(_) => 0x03,
            Self::SelectAccountType(_) => 0x04,
            Self::AuthorizationResponse(_) => 0x05,
            Self::RequestCardPresence => 0x06,
            Self::PowerupHint { .. } => 0x07,
            Self::SetLoyaltyUrl { .. } => 0x08,
            Self::SetLoyaltyVas(_) => 0x09,
            Self::GetVasData => 0x0A,
            Self::ReadNdef { .. } => 0x0B,
            Self::WriteNdef { .. } => 0x0C,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmvComplete {
    pub result: PaymentResult,
    /// Clearing or reversal message for the server, empty if none
    pub data: Vec<u8, MAX_PAYMENT_BLOB>,
    pub approved_offline: bool,
    pub card_info: CardInfo,
    pub std_msg: StdMsg,
    pub card_action: CardAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmvEvent {
    CardPresence(CardPresence),
    /// The chip would not power up
    IccPowerFailure,
    CardAction { action: CardAction, std_msg: StdMsg },
    ApplicationSelection(Vec<PaymentApplication, MAX_APPLICATIONS>),
    AccountTypeSelection {
        account_types: Vec<AccountType, ACCOUNT_TYPE_MAX>,
        language_prefs: [u16; LANGUAGE_PREFS],
        aid: Vec<u8, ADF_NAME_MAX>,
    },
    AuthorizationRequest {
        data: Vec<u8, MAX_PAYMENT_BLOB>,
        card_presence_required: bool,
        contactless: bool,
        card_info: CardInfo,
    },
    CardholderName(CardInfo),
    AudioVisual(u16),
    Complete(EmvComplete),
    VasResponse {
        protocol: VasProtocol,
        result: LoyaltyResult,
        /// False when an authorization follows
        finished: bool,
        merchant_loyalty_id: MerchantLoyaltyId,
        /// Encrypted buyer loyalty id
        data: Vec<u8, MAX_VAS_DATA>,
    },
    NdefRead {
        application_type: NdefApplicationType,
        merchant_id: Vec<u8, NDEF_MERCHANT_ID_MAX>,
        card_id: Vec<u8, NDEF_CARD_ID_MAX>,
        card_type: u8,
        result: NdefResult,
    },
    NdefWrite(NdefResult),
}

impl AppMessage for EmvEvent {
    const ENDPOINT: EndpointId = EndpointId::EMV_FLOW;

    fn msg_type(&self) -> u16 {
        match self {
            Self::CardPresence(_) => 0x81,
            Self::IccPowerFailure => 0x82,
            Self::CardAction { .. } => 0x83,
            Self::ApplicationSelection(_) => 0x84,
            Self::AccountTypeSelection { .. } => 0x85,
            Self::AuthorizationRequest { .. } => 0x86,
            Self::CardholderName(_) => 0x87,
            Self::AudioVisual(_) => 0x88,
            Self::Complete(_) => 0x89,
            Self::VasResponse { .. } => 0x8A,
            Self::NdefRead { .. } => 0x8B,
            Self::NdefWrite(_) => 0x8C,
        }
    }
}

/// Factory maintenance of the stripe heads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MagswipeRequest {
    GetStatus(PaymentSource),
    Configure(PaymentSource),
    ClearConfiguration(PaymentSource),
    Dump(PaymentSource),
}

impl AppMessage for MagswipeRequest {
    const ENDPOINT: EndpointId = EndpointId::MAGSWIPE;

    fn msg_type(&self) -> u16 {
        match self {
            Self::GetStatus(_) => 0x01,
            Self::Configure(_) => 0x02,
            Self::ClearConfiguration(_) => 0x03,
            Self::Dump(_) => 0x04,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MagswipeEvent {
    Swipe {
        /// Encrypted track data for the server
        data: Vec<u8, MAX_SWIPE_DATA>,
        card_info: CardInfo,
        /// The card carries a chip and should have been dipped
        has_icc: bool,
        source: PaymentSource,
    },
    SwipeFailed { source: PaymentSource },
    Health { source: PaymentSource, status: u32 },
    /// Configure or clear accepted
    ConfigureAck { source: PaymentSource },
    ConfigureError { source: PaymentSource },
    Dump {
        source: PaymentSource,
        data: Vec<u8, MSR_DUMP_MAX>,
    },
}

impl AppMessage for MagswipeEvent {
    const ENDPOINT: EndpointId = EndpointId::MAGSWIPE;

    fn msg_type(&self) -> u16 {
        match self {
            Self::Swipe { .. } => 0x81,
            Self::SwipeFailed { .. } => 0x82,
            Self::Health { .. } => 0x83,
            Self::ConfigureAck { .. } => 0x84,
            Self::ConfigureError { .. } => 0x85,
            Self::Dump { .. } => 0x86,
        }
    }
}

/// E-money brand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TmnBrand {
    Suica,
    Id,
    Quicpay,
    Edy,
    Waon,
    Nanaco,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TmnRequestType {
    Transaction,
    Refund,
    CheckBalance,
    CheckResult,
    VoidUnknown,
    Miryo,
}

/// Final state of a TMN transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TmnResult {
    Success,
    Canceled,
    CardReadError,
    InsufficientBalance,
    ServerError,
    Timeout,
    MiryoResolutionFailure,
    AlreadyComplete,
    Terminated,
    Unknown,
}

pub type TmnTransactionId = String<TMN_TRANSACTION_ID_LEN>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TmnRequest {
    Start {
        request_type: TmnRequestType,
        transaction_id: TmnTransactionId,
        brand: TmnBrand,
        amount: u32,
        /// Set for check-result and void, the transaction being asked about
        prev_transaction_id: Option<TmnTransactionId>,
    },
    StartMiryo {
        transaction_id: TmnTransactionId,
        miryo_data: Vec<u8, TMN_MAX_MIRYO_DATA>,
    },
    /// Bytes from the TMN server for the reader
    Data(Vec<u8, MAX_PAYMENT_BLOB>),
    WriteNotifyAck,
    /// Polling is still running, ask the reader to stop cleanly
    Cancel,
    /// Card detected but write notify not acknowledged, abandon the transaction
    ForceTerminate,
}

impl AppMessage for TmnRequest {
    const ENDPOINT: EndpointId = EndpointId::TMN;

    fn msg_type(&self) -> u16 {
        match self {
            Self::Start { .. } => 0x01,
            Self::StartMiryo { .. } => 0x02,
            Self::Data(_) => 0x03,
            Self::WriteNotifyAck => 0x04,
            Self::Cancel => 0x05,
            Self::ForceTerminate => 0x06,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TmnEvent {
    /// Bytes for the TMN server
    Data {
        transaction_id: TmnTransactionId,
        data: Vec<u8, MAX_PAYMENT_BLOB>,
    },
    /// Card detected, polling is over
    CardDetected,
    AuthorizationRequest(Vec<u8, MAX_PAYMENT_BLOB>),
    WriteNotify {
        balance_before: u32,
        amount: u32,
        miryo_data: Vec<u8, TMN_MAX_MIRYO_DATA>,
    },
    Display {
        msg_id: u16,
        amount: String<TMN_MAX_DISPLAY_STRING>,
        balance: String<TMN_MAX_DISPLAY_STRING>,
    },
    Audio(u16),
    Complete(TmnResult),
}

impl AppMessage for TmnEvent {
    const ENDPOINT: EndpointId = EndpointId::TMN;

    fn msg_type(&self) -> u16 {
        match self {
            Self::Data { .. } => 0x81,
            Self::CardDetected => 0x82,
            Self::AuthorizationRequest(_) => 0x83,
            Self::WriteNotify { .. } => 0x84,
            Self::Display { .. } => 0x85,
            Self::Audio(_) => 0x86,
            Self::Complete(_) => 0x87,
        }
    }
}
