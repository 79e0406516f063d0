//! Power endpoint messages.

use serde::{Deserialize, Serialize};

use crate::protocol::{AppMessage, EndpointId};

/// How the reader is currently powered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BatteryMode {
    Discharging,
    Charging,
    Charged,
    LowCritical,
}

/// One battery reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BatteryStatus {
    pub charge_percentage: u32,
    /// Milliamps, negative while discharging
    pub current: i32,
    /// Millivolts
    pub voltage: u32,
    /// Degrees Celsius
    pub temperature: i32,
    pub is_critical: bool,
    pub mode: BatteryMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerRequest {
    GetBatteryVoltage,
    Reset,
    Off,
    SetLpsTimeout { timeout_ms: u32 },
}

impl AppMessage for PowerRequest {
    const ENDPOINT: EndpointId = EndpointId::POWER;

    fn msg_type(&self) -> u16 {
        match self {
            Self::GetBatteryVoltage => 0x01,
            Self::Reset => 0x02,
            Self::Off => 0x03,
            Self::SetLpsTimeout { .. } => 0x04,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerEvent {
    BatteryVoltage(BatteryStatus),
    BatteryError,
    ResetAck,
    OffAck,
    LpsTimeoutAck,
}

impl AppMessage for PowerEvent {
    const ENDPOINT: EndpointId = EndpointId::POWER;

    fn msg_type(&self) -> u16 {
        match self {
            Self::BatteryVoltage(_) => 0x81,
            Self::BatteryError => 0x82,
            Self::ResetAck => 0x83,
            Self::OffAck => 0x84,
            Self::LpsTimeoutAck => 0x85,
        }
    }
}
