use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tracing::trace;

use super::smoothing::{MovingAverage, TEMPERATURE_SAMPLES};
use super::{Listener, notify};
use crate::register_cache::{Error, Registers};
use crate::registers::{
    self, FanMode, ZONE_CURRENT_TEMP, ZONE_ENABLED, ZONE_MODE, ZONE_TARGET_TEMP, zone_register,
};

/// What to do when the state of a zone changes. Listeners that are not set are not invoked.
#[derive(Default)]
pub struct ZoneListeners {
    enabled: Option<Listener<bool>>,
    target_temperature: Option<Listener<f32>>,
    fan_mode: Option<Listener<Option<FanMode>>>,
    operating_mode: Option<Listener<u16>>,
    current_temperature: Option<Listener<f32>>,
}

impl ZoneListeners {
    /// Invoked with the new on/off state whenever the `ENABLED` register changes.
    pub fn on_enabled_change(mut self, listener: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.enabled = Some(Box::new(listener));
        self
    }

    pub fn on_target_temperature_change(
        mut self,
        listener: impl Fn(f32) + Send + Sync + 'static,
    ) -> Self {
        self.target_temperature = Some(Box::new(listener));
        self
    }

    /// `None` is passed for fan mode codes the zone reports but that are not known.
    pub fn on_fan_mode_change(
        mut self,
        listener: impl Fn(Option<FanMode>) + Send + Sync + 'static,
    ) -> Self {
        self.fan_mode = Some(Box::new(listener));
        self
    }

    pub fn on_operating_mode_change(mut self, listener: impl Fn(u16) + Send + Sync + 'static) -> Self {
        self.operating_mode = Some(Box::new(listener));
        self
    }

    /// Invoked with the smoothed temperature, see [`Zone::sample_temperature`].
    pub fn on_current_temperature_change(
        mut self,
        listener: impl Fn(f32) + Send + Sync + 'static,
    ) -> Self {
        self.current_temperature = Some(Box::new(listener));
        self
    }
}

/// One thermostat zone of a module.
pub struct Zone {
    number: u8,
    registers: Arc<dyn Registers>,
    listeners: OnceLock<Arc<ZoneListeners>>,
    temperature: Mutex<MovingAverage>,
}

impl Zone {
    /// `number` counts from 1.
    pub fn new(number: u8, registers: Arc<dyn Registers>) -> Self {
        Self {
            number,
            registers,
            listeners: OnceLock::new(),
            temperature: Mutex::new(MovingAverage::new(TEMPERATURE_SAMPLES)),
        }
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    fn address(&self, offset: u16) -> u16 {
        zone_register(self.number, offset)
    }

    /// Hook the listeners up to the zone's registers.
    ///
    /// The listeners of the first call stay in place for the lifetime of the zone.
    pub fn watch(&self, listeners: ZoneListeners) -> Result<(), Error> {
        let listeners = Arc::clone(self.listeners.get_or_init(|| Arc::new(listeners)));
        let enabled = Arc::clone(&listeners);
        self.registers.register_callback(
            self.address(ZONE_ENABLED),
            Arc::new(move |_, word| notify(&enabled.enabled, registers::is_on(word))),
        )?;
        let target = Arc::clone(&listeners);
        self.registers.register_callback(
            self.address(ZONE_TARGET_TEMP),
            Arc::new(move |_, word| {
                notify(&target.target_temperature, registers::decode_temperature(word))
            }),
        )?;
        self.registers.register_callback(
            self.address(ZONE_MODE),
            Arc::new(move |_, word| {
                notify(&listeners.fan_mode, FanMode::from_code(registers::fan_mode_code(word)));
                notify(&listeners.operating_mode, registers::operating_mode_code(word));
            }),
        )
    }

    fn read(&self, offset: u16) -> Result<u16, Error> {
        self.registers.read(self.address(offset))
    }

    pub fn is_present(&self) -> Result<bool, Error> {
        self.read(ZONE_ENABLED).map(registers::is_present)
    }

    pub fn is_on(&self) -> Result<bool, Error> {
        self.read(ZONE_ENABLED).map(registers::is_on)
    }

    pub async fn set_on(&self, on: bool) -> Result<(), Error> {
        self.registers.write(self.address(ZONE_ENABLED), registers::enabled_word(on)).await?;
        Ok(())
    }

    pub fn target_temperature(&self) -> Result<f32, Error> {
        self.read(ZONE_TARGET_TEMP).map(registers::decode_temperature)
    }

    /// Set the target temperature, rounded to the nearest half degree.
    pub async fn set_target_temperature(&self, celsius: f32) -> Result<(), Error> {
        let word = registers::encode_temperature(celsius);
        self.registers.write(self.address(ZONE_TARGET_TEMP), word).await?;
        Ok(())
    }

    /// The most recent temperature reading, without any smoothing.
    pub fn current_temperature(&self) -> Result<f32, Error> {
        self.read(ZONE_CURRENT_TEMP).map(registers::decode_temperature)
    }

    pub fn fan_mode(&self) -> Result<Option<FanMode>, Error> {
        self.read(ZONE_MODE).map(|mode| FanMode::from_code(registers::fan_mode_code(mode)))
    }

    pub async fn set_fan_mode(&self, fan: FanMode) -> Result<(), Error> {
        let mode = self.read(ZONE_MODE)?;
        self.registers.write(self.address(ZONE_MODE), registers::with_fan_mode(mode, fan)).await?;
        Ok(())
    }

    pub fn operating_mode_code(&self) -> Result<u16, Error> {
        self.read(ZONE_MODE).map(registers::operating_mode_code)
    }

    /// Feed the current temperature reading into the zone's moving average, notifying the
    /// listener when the average, rounded to a tenth of a degree, changes.
    pub fn sample_temperature(&self) -> Result<(), Error> {
        let sample = self.current_temperature()?;
        let changed =
            self.temperature.lock().unwrap_or_else(PoisonError::into_inner).push(sample);
        if let Some(average) = changed {
            trace!(zone = self.number, sample, average, "zone temperature changed");
            if let Some(listeners) = self.listeners.get() {
                notify(&listeners.current_temperature, average);
            }
        }
        Ok(())
    }
}
