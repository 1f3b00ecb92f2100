//! Translation between the controller side modes and the appliance operating mode codes.
//!
//! The appliance knows a handful of operating modes, each a combination of cooling or heating
//! with a set of emitters. The controller side splits these into an HVAC mode (cool or heat) and
//! a hold mode (which emitters to use). Selecting an HVAC mode passes unknown codes through
//! untouched, while selecting a hold mode treats them as heating.

use crate::registers::{HoldMode, HvacMode, OperatingMode};

/// The operating mode code that results from selecting `target` while the appliance runs in
/// `current`. Switching to [`HvacMode::Off`] is a matter of the zone, not of the appliance, and
/// leaves the code unchanged.
pub fn apply_hvac_mode(current: u16, target: HvacMode) -> u16 {
    use OperatingMode::*;
    let new = match (OperatingMode::from_code(current), target) {
        (Some(AirCool), HvacMode::Heat) => AirHeat,
        (Some(AirHeat), HvacMode::Cool) => AirCool,
        (Some(UnderfloorAirCool), HvacMode::Heat) => UnderfloorAirHeat,
        (Some(UnderfloorAirHeat | UnderfloorHeat), HvacMode::Cool) => UnderfloorAirCool,
        _ => return current,
    };
    new.code()
}

/// The operating mode code that results from selecting the `hold` emitters while the appliance
/// runs in `current`, keeping the cooling/heating direction. Anything that is not known to be
/// cooling counts as heating.
pub fn apply_hold_mode(current: u16, hold: HoldMode) -> u16 {
    use OperatingMode::*;
    let cool = matches!(OperatingMode::from_code(current), Some(AirCool | UnderfloorAirCool));
    let new = match (hold, cool) {
        (HoldMode::FanOnly, true) => AirCool,
        (HoldMode::FanOnly, false) => AirHeat,
        // There is no underfloor-only cooling, the fans have to help out.
        (HoldMode::UnderfloorOnly, true) => UnderfloorAirCool,
        (HoldMode::UnderfloorOnly, false) => UnderfloorHeat,
        (HoldMode::UnderfloorAndFan, true) => UnderfloorAirCool,
        (HoldMode::UnderfloorAndFan, false) => UnderfloorAirHeat,
    };
    new.code()
}

/// The HVAC mode the controller should show for the appliance state. `None` if the operating
/// mode code is not known.
pub fn hvac_mode(system_enabled: bool, code: u16) -> Option<HvacMode> {
    use OperatingMode::*;
    if !system_enabled {
        return Some(HvacMode::Off);
    }
    match OperatingMode::from_code(code)? {
        AirCool | UnderfloorAirCool => Some(HvacMode::Cool),
        AirHeat | UnderfloorHeat | UnderfloorAirHeat => Some(HvacMode::Heat),
    }
}

pub fn hold_mode(code: u16) -> Option<HoldMode> {
    use OperatingMode::*;
    Some(match OperatingMode::from_code(code)? {
        AirCool | AirHeat => HoldMode::FanOnly,
        UnderfloorHeat => HoldMode::UnderfloorOnly,
        UnderfloorAirCool | UnderfloorAirHeat => HoldMode::UnderfloorAndFan,
    })
}
