//! Tracked Channel Set

use crate::TelemetryError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of tracked channels
pub const CHANNEL_COUNT: usize = 6;

/// A tracked sensor channel.
///
/// The declaration order is significant: feature vectors are laid out in
/// exactly this order, so reordering variants changes every persisted model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Engine speed (rev/min)
    Rpm,
    /// Calculated engine load (%)
    EngineLoad,
    /// Throttle position (%)
    ThrottlePos,
    /// Long term fuel trim, bank 1 (%)
    FuelTrim,
    /// Engine coolant temperature (°C)
    CoolantTemp,
    /// Adapter supply voltage (V)
    SupplyVoltage,
}

impl Channel {
    /// All channels in feature order
    pub const ALL: [Channel; CHANNEL_COUNT] = [
        Channel::Rpm,
        Channel::EngineLoad,
        Channel::ThrottlePos,
        Channel::FuelTrim,
        Channel::CoolantTemp,
        Channel::SupplyVoltage,
    ];

    /// Position of this channel in feature order
    pub fn index(self) -> usize {
        self as usize
    }

    /// Canonical channel name
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Rpm => "rpm",
            Channel::EngineLoad => "engine_load",
            Channel::ThrottlePos => "throttle_pos",
            Channel::FuelTrim => "fuel_trim",
            Channel::CoolantTemp => "coolant_temp",
            Channel::SupplyVoltage => "supply_voltage",
        }
    }

    /// Column name used by the legacy time-series schema
    pub fn legacy_column(self) -> &'static str {
        match self {
            Channel::FuelTrim => "long_fuel_trim_1",
            Channel::SupplyVoltage => "elm_voltage",
            other => other.as_str(),
        }
    }

    /// Resolve a channel from its canonical name, legacy column, or worker PID name.
    pub fn from_name(name: &str) -> Option<Channel> {
        let name = name.trim().to_ascii_lowercase();
        Channel::ALL
            .into_iter()
            .find(|c| c.as_str() == name || c.legacy_column() == name)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::from_name(s).ok_or_else(|| TelemetryError::UnknownChannel(s.to_string()))
    }
}
