use std::fmt::Display;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Lowest baud rate the agent will accept.
///
/// Anything below this is virtually always a typo rather than real hardware;
/// non-standard rates above it are passed through to the driver untouched.
pub const MIN_BAUD_RATE: u32 = 300;

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DataBits {
    /// 5 bits per character.
    Five,
    /// 6 bits per character.
    Six,
    /// 7 bits per character.
    Seven,
    /// 8 bits per character.
    Eight,
}

impl From<DataBits> for u8 {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

impl TryFrom<u8> for DataBits {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            other => Err(format!("data bits must be 5..=8, got {other}")),
        }
    }
}

impl Display for DataBits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// Number of stop bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopBits {
    /// One stop bit.
    One,
    /// One and a half stop bits.
    OneAndHalf,
    /// Two stop bits.
    Two,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Parity {
    /// No parity bit.
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
    /// Parity bit always set.
    Mark,
    /// Parity bit always clear.
    Space,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowControl {
    /// No flow control.
    None,
    /// RTS/CTS hardware flow control.
    Hardware,
    /// XON/XOFF software flow control.
    Software,
}

/// Settings applied to a port when opening or reconfiguring it.
///
/// Immutable value object; [`PortSettings::validate`] must pass before any
/// driver operation uses it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSettings {
    /// Symbol rate in baud.
    pub baud_rate: u32,
    /// Data bits per character.
    pub data_bits: DataBits,
    /// Stop bits per character.
    pub stop_bits: StopBits,
    /// Parity mode.
    pub parity: Parity,
    /// Flow control mode.
    pub flow_control: FlowControl,
    /// Driver read timeout in milliseconds. `0` keeps the driver default.
    pub read_timeout_ms: u32,
    /// Driver write timeout in milliseconds. `0` keeps the driver default.
    pub write_timeout_ms: u32,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControl::None,
            read_timeout_ms: 1000,
            write_timeout_ms: 1000,
        }
    }
}

impl PortSettings {
    /// Check the settings are expressible on real hardware.
    pub fn validate(&self) -> Result<(), Error> {
        if self.baud_rate < MIN_BAUD_RATE {
            return Err(Error::InvalidConfig(format!(
                "baud rate {} is below the minimum of {MIN_BAUD_RATE}",
                self.baud_rate
            )));
        }

        Ok(())
    }

    /// The configured read timeout, or `None` when the driver default applies.
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(u64::from(self.read_timeout_ms)))
    }
}

impl Display for PortSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}{}{} {:?}",
            self.baud_rate,
            self.data_bits,
            match self.parity {
                Parity::None => "N",
                Parity::Odd => "O",
                Parity::Even => "E",
                Parity::Mark => "M",
                Parity::Space => "S",
            },
            match self.stop_bits {
                StopBits::One => "1",
                StopBits::OneAndHalf => "1.5",
                StopBits::Two => "2",
            },
            self.flow_control
        )
    }
}

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        }
    }
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow_control: FlowControl) -> Self {
        match flow_control {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
            FlowControl::Software => serialport::FlowControl::Software,
        }
    }
}

impl TryFrom<StopBits> for serialport::StopBits {
    type Error = Error;

    fn try_from(stop_bits: StopBits) -> Result<Self, Error> {
        match stop_bits {
            StopBits::One => Ok(serialport::StopBits::One),
            StopBits::Two => Ok(serialport::StopBits::Two),
            StopBits::OneAndHalf => Err(Error::InvalidConfig(
                "one and a half stop bits are not supported by the system driver".into(),
            )),
        }
    }
}

impl TryFrom<Parity> for serialport::Parity {
    type Error = Error;

    fn try_from(parity: Parity) -> Result<Self, Error> {
        match parity {
            Parity::None => Ok(serialport::Parity::None),
            Parity::Odd => Ok(serialport::Parity::Odd),
            Parity::Even => Ok(serialport::Parity::Even),
            Parity::Mark | Parity::Space => Err(Error::InvalidConfig(
                "mark/space parity is not supported by the system driver".into(),
            )),
        }
    }
}
