//! Home Assistant MQTT discovery descriptors, announcing every zone as a climate entity plus a
//! temperature sensor.

use serde_json::json;

use super::Topics;
use crate::registers::{FanMode, HoldMode, HvacMode};

pub const MIN_TEMPERATURE: f32 = 15.0;
pub const MAX_TEMPERATURE: f32 = 35.0;

/// The modes a controller may request, in the order they are offered.
const FAN_MODES: [FanMode; 4] = [FanMode::Auto, FanMode::Low, FanMode::Medium, FanMode::High];

/// A retained discovery message.
pub struct Descriptor {
    pub topic: String,
    pub payload: serde_json::Value,
}

fn device(module: &str) -> serde_json::Value {
    json!({
        "identifiers": [module],
        "name": module,
    })
}

pub fn climate(topics: &Topics, zone: u8) -> Descriptor {
    let module = topics.module();
    let name = format!("{module}_zone{zone}");
    let hold_modes = HoldMode::ALL.map(|m| m.to_string());
    let payload = json!({
        "name": name,
        "unique_id": name,
        "device": device(module),
        "current_temperature_topic": topics.zone(zone, "currentTemp"),
        "precision": 0.1,
        "temperature_state_topic": topics.zone(zone, "targetTemp"),
        "temperature_command_topic": topics.zone_command(zone, "targetTemp"),
        "temperature_unit": "C",
        "temp_step": 0.5,
        "min_temp": MIN_TEMPERATURE,
        "max_temp": MAX_TEMPERATURE,
        "modes": HvacMode::ALL.map(|m| m.to_string()),
        "mode_state_topic": topics.zone(zone, "hvacMode"),
        "mode_command_topic": topics.zone_command(zone, "hvacMode"),
        "fan_modes": FAN_MODES.map(|m| m.to_string()),
        "fan_mode_state_topic": topics.zone(zone, "fanMode"),
        "fan_mode_command_topic": topics.zone_command(zone, "fanMode"),
        "hold_modes": hold_modes,
        "hold_state_topic": topics.system("holdMode"),
        "hold_command_topic": topics.system_command("holdMode"),
    });
    Descriptor { topic: topics.discovery("climate", &format!("zone{zone}")), payload }
}

pub fn temperature_sensor(topics: &Topics, zone: u8) -> Descriptor {
    let module = topics.module();
    let name = format!("{module}_zone{zone}_temp");
    let payload = json!({
        "name": name,
        "unique_id": name,
        "device": device(module),
        "device_class": "temperature",
        "state_topic": topics.zone(zone, "currentTemp"),
        "unit_of_measurement": "°C",
    });
    Descriptor { topic: topics.discovery("sensor", &format!("zone{zone}_temp")), payload }
}
