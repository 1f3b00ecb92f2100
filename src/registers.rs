//! The holding register map of the climate controller.
//!
//! Addresses are 1-based throughout the crate. The controller exposes two blocks of interest: a
//! zone block of sixteen four-register zones starting at address 1, and a system block of 18
//! registers starting at address 65.

use std::fmt;

pub const NUM_ZONES: u8 = 16;
pub const REGISTERS_PER_ZONE: u16 = 4;

/// Offsets of the registers within a zone, relative to the zone's first register minus one.
pub const ZONE_ENABLED: u16 = 1;
pub const ZONE_MODE: u16 = 2;
pub const ZONE_TARGET_TEMP: u16 = 3;
pub const ZONE_CURRENT_TEMP: u16 = 4;

pub const AIRFLOW: u16 = 65;
pub const AC_TARGET_TEMP: u16 = 69;
pub const AC_TARGET_FAN_MODE: u16 = 73;
pub const SERIAL_CONFIG: u16 = 77;
pub const SLAVE_ID: u16 = 78;
pub const EFFICIENCY: u16 = 79;
pub const SYSTEM_ENABLED: u16 = 81;
pub const SYS_OP_MODE: u16 = 82;

pub const ZONE_WINDOW_BASE: u16 = ZONE_ENABLED;
pub const ZONE_WINDOW_LEN: u16 = NUM_ZONES as u16 * REGISTERS_PER_ZONE;
pub const SYSTEM_WINDOW_BASE: u16 = AIRFLOW;
pub const SYSTEM_WINDOW_LEN: u16 = 18;

pub const AC_UNITS: u8 = 4;

const ENABLED_ON: u16 = 0b01;
const ENABLED_PRESENT: u16 = 0b10;

/// Absolute address of a zone register. Zones are numbered from 1.
pub const fn zone_register(zone: u8, offset: u16) -> u16 {
    (zone as u16 - 1) * REGISTERS_PER_ZONE + offset
}

/// Absolute address of a per indoor unit register. Units are numbered from 1.
pub const fn ac_register(first: u16, unit: u8) -> u16 {
    first + unit as u16 - 1
}

pub fn is_present(enabled: u16) -> bool {
    enabled & ENABLED_PRESENT != 0
}

pub fn is_on(enabled: u16) -> bool {
    enabled & ENABLED_ON != 0
}

/// The `ENABLED` word for a present zone. The presence bit is always kept set.
pub fn enabled_word(on: bool) -> u16 {
    if on { ENABLED_PRESENT | ENABLED_ON } else { ENABLED_PRESENT }
}

/// Temperatures are stored as half degrees Celsius in the low byte. The high byte carries
/// unrelated flags on some firmware revisions and is ignored.
pub fn decode_temperature(word: u16) -> f32 {
    f32::from(word & 0x00FF) / 2.0
}

pub fn encode_temperature(celsius: f32) -> u16 {
    (celsius * 2.0).round().clamp(0.0, 255.0) as u16
}

pub fn fan_mode_code(mode: u16) -> u16 {
    (mode & 0x00F0) >> 4
}

pub fn operating_mode_code(mode: u16) -> u16 {
    mode & 0x000F
}

/// Replace the fan mode nibble of a `MODE` word, keeping the operating mode nibble.
pub fn with_fan_mode(mode: u16, fan: FanMode) -> u16 {
    ((fan as u16) << 4) | operating_mode_code(mode)
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, strum::FromRepr, strum::EnumString, strum::Display,
    strum::IntoStaticStr, serde::Serialize,
)]
#[repr(u16)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FanMode {
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    Auto = 4,
}

impl FanMode {
    pub fn from_code(code: u16) -> Option<Self> {
        Self::from_repr(code)
    }

    /// Name of a fan mode code, `"unknown"` for codes outside of the known set.
    pub fn name_of(code: u16) -> &'static str {
        name_or_unknown(Self::from_code(code))
    }
}

/// The operating mode codes of the appliance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::FromRepr, strum::Display)]
#[repr(u16)]
pub enum OperatingMode {
    #[strum(serialize = "air cooling")]
    AirCool = 0x01,
    #[strum(serialize = "air heating")]
    AirHeat = 0x02,
    #[strum(serialize = "underfloor heating")]
    UnderfloorHeat = 0x04,
    #[strum(serialize = "underfloor air cooling")]
    UnderfloorAirCool = 0x05,
    #[strum(serialize = "underfloor air heating")]
    UnderfloorAirHeat = 0x06,
}

impl OperatingMode {
    pub fn from_code(code: u16) -> Option<Self> {
        Self::from_repr(code)
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn name_of(code: u16) -> String {
        Self::from_code(code).map_or_else(|| "unknown".to_string(), |m| m.to_string())
    }
}

/// Controller side HVAC mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::EnumString, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum HvacMode {
    Cool,
    Heat,
    Off,
}

impl HvacMode {
    pub const ALL: [HvacMode; 3] = [HvacMode::Cool, HvacMode::Heat, HvacMode::Off];
}

/// Controller side hold mode, selecting which emitters the appliance uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::EnumString, strum::Display, strum::IntoStaticStr)]
pub enum HoldMode {
    #[strum(serialize = "underfloor only")]
    UnderfloorOnly,
    #[strum(serialize = "fan only")]
    FanOnly,
    #[strum(serialize = "underfloor and fan")]
    UnderfloorAndFan,
}

impl HoldMode {
    pub const ALL: [HoldMode; 3] =
        [HoldMode::UnderfloorOnly, HoldMode::FanOnly, HoldMode::UnderfloorAndFan];
}

/// Renders an optional mode as its name or `"unknown"`.
pub fn name_or_unknown<M: Into<&'static str>>(mode: Option<M>) -> &'static str {
    mode.map_or("unknown", Into::into)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    Even,
    None,
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Parity::Even => "even",
            Parity::None => "none",
        })
    }
}

/// Serial line settings the appliance reports in `SERIAL_CONFIG`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub parity: Parity,
}

impl SerialConfig {
    pub fn from_word(word: u16) -> Option<Self> {
        let (baud_rate, parity) = match word {
            2 => (9600, Parity::Even),
            3 => (19200, Parity::Even),
            6 => (9600, Parity::None),
            7 => (19200, Parity::None),
            _ => return None,
        };
        Some(Self { baud_rate, parity })
    }
}

#[derive(serde::Serialize)]
pub struct RegisterSchema {
    pub address: u16,
    pub name: String,
    pub description: &'static str,
}

impl RegisterSchema {
    pub fn all_registers() -> impl Iterator<Item = Self> {
        let zones = (1..=NUM_ZONES).flat_map(|zone| {
            [
                (ZONE_ENABLED, "ENABLED", "bit 0: zone on, bit 1: zone present"),
                (ZONE_MODE, "MODE", "bits 0-3: operating mode, bits 4-7: fan mode"),
                (ZONE_TARGET_TEMP, "TARGET_TEMP", "target temperature in half degrees"),
                (ZONE_CURRENT_TEMP, "CURRENT_TEMP", "measured temperature in half degrees"),
            ]
            .into_iter()
            .map(move |(offset, name, description)| RegisterSchema {
                address: zone_register(zone, offset),
                name: format!("ZONE{zone}_{name}"),
                description,
            })
        });
        let units = (1..=AC_UNITS).flat_map(|unit| {
            [
                (AIRFLOW, "AIRFLOW", "indoor unit airflow"),
                (AC_TARGET_TEMP, "TARGET_TEMP", "indoor unit target temperature in half degrees"),
                (AC_TARGET_FAN_MODE, "TARGET_FAN_MODE", "indoor unit fan mode"),
            ]
            .into_iter()
            .map(move |(first, name, description)| RegisterSchema {
                address: ac_register(first, unit),
                name: format!("AC{unit}_{name}"),
                description,
            })
        });
        let system = [
            (SERIAL_CONFIG, "SERIAL_CONFIG", "2: 9600/even, 3: 19200/even, 6: 9600/none, 7: 19200/none"),
            (SLAVE_ID, "SLAVE_ID", "modbus slave id of the appliance"),
            (EFFICIENCY, "EFFICIENCY", "efficiency setting"),
            (SYSTEM_ENABLED, "SYSTEM_ENABLED", "non-zero when the system is enabled"),
            (SYS_OP_MODE, "SYS_OP_MODE", "system operating mode code"),
        ]
        .into_iter()
        .map(|(address, name, description)| RegisterSchema {
            address,
            name: name.to_string(),
            description,
        });
        let mut all = zones.chain(units).chain(system).collect::<Vec<_>>();
        all.sort_by_key(|r| r.address);
        all.into_iter()
    }

    pub fn is_match(&self, pattern: &str) -> bool {
        let pattern = pattern.to_uppercase();
        self.name.contains(&pattern)
            || self.description.to_uppercase().contains(&pattern)
            || self.address.to_string().contains(&pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_addresses_are_one_based() {
        assert_eq!(zone_register(1, ZONE_ENABLED), 1);
        assert_eq!(zone_register(1, ZONE_CURRENT_TEMP), 4);
        assert_eq!(zone_register(16, ZONE_CURRENT_TEMP), ZONE_WINDOW_LEN);
        assert_eq!(ac_register(AC_TARGET_FAN_MODE, 4), 76);
    }

    #[test]
    fn temperature_ignores_high_byte() {
        assert_eq!(decode_temperature(41), 20.5);
        assert_eq!(decode_temperature(0x1229), 20.5);
        assert_eq!(encode_temperature(20.5), 41);
        assert_eq!(encode_temperature(21.3), 43);
    }

    #[test]
    fn fan_mode_occupies_high_nibble() {
        assert_eq!(fan_mode_code(0x44), 4);
        assert_eq!(operating_mode_code(0x44), 4);
        assert_eq!(with_fan_mode(0x0301, FanMode::High), 0x31);
    }

    #[test]
    fn enabled_word_keeps_presence() {
        assert!(is_present(enabled_word(true)));
        assert!(is_present(enabled_word(false)));
        assert_eq!(enabled_word(false), 0x02);
        assert_eq!(enabled_word(true), 0x03);
    }

    #[test]
    fn mode_names() {
        assert_eq!("medium".parse::<FanMode>().unwrap(), FanMode::Medium);
        assert!("turbo".parse::<FanMode>().is_err());
        assert_eq!(FanMode::name_of(9), "unknown");
        assert_eq!(FanMode::High.to_string(), "high");
        assert_eq!("underfloor and fan".parse::<HoldMode>().unwrap(), HoldMode::UnderfloorAndFan);
        assert_eq!(HoldMode::FanOnly.to_string(), "fan only");
        assert_eq!("off".parse::<HvacMode>().unwrap(), HvacMode::Off);
        assert_eq!(name_or_unknown(None::<HvacMode>), "unknown");
        assert_eq!(OperatingMode::name_of(0x05), "underfloor air cooling");
    }

    #[test]
    fn serial_config_table() {
        assert_eq!(
            SerialConfig::from_word(3),
            Some(SerialConfig { baud_rate: 19200, parity: Parity::Even })
        );
        assert_eq!(SerialConfig::from_word(6).map(|c| c.parity), Some(Parity::None));
        assert_eq!(SerialConfig::from_word(4), None);
    }

    #[test]
    fn register_map_is_sorted_and_complete() {
        let all = RegisterSchema::all_registers().collect::<Vec<_>>();
        assert_eq!(all.len(), 64 + 12 + 5);
        assert!(all.windows(2).all(|w| w[0].address < w[1].address));
        assert!(all.iter().any(|r| r.name == "ZONE3_MODE" && r.address == 10));
    }
}
