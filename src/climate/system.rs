use std::sync::Arc;

use super::{Listener, modes, notify};
use crate::register_cache::{Error, Registers};
use crate::registers::{
    self, AC_TARGET_FAN_MODE, AC_TARGET_TEMP, AC_UNITS, AIRFLOW, EFFICIENCY, FanMode, HoldMode,
    HvacMode, SERIAL_CONFIG, SLAVE_ID, SYS_OP_MODE, SYSTEM_ENABLED, SerialConfig, ac_register,
};

/// Invoked with the number of the indoor unit, counting from 1, and its new value.
type UnitListener<T> = Box<dyn Fn(u8, T) + Send + Sync>;

#[derive(Default)]
pub struct SystemListeners {
    airflow: Option<UnitListener<u16>>,
    target_temperature: Option<UnitListener<f32>>,
    fan_mode: Option<UnitListener<Option<FanMode>>>,
    efficiency: Option<Listener<u16>>,
    enabled: Option<Listener<bool>>,
    operating_mode: Option<Listener<u16>>,
}

impl SystemListeners {
    pub fn on_airflow_change(mut self, listener: impl Fn(u8, u16) + Send + Sync + 'static) -> Self {
        self.airflow = Some(Box::new(listener));
        self
    }

    pub fn on_target_temperature_change(
        mut self,
        listener: impl Fn(u8, f32) + Send + Sync + 'static,
    ) -> Self {
        self.target_temperature = Some(Box::new(listener));
        self
    }

    pub fn on_fan_mode_change(
        mut self,
        listener: impl Fn(u8, Option<FanMode>) + Send + Sync + 'static,
    ) -> Self {
        self.fan_mode = Some(Box::new(listener));
        self
    }

    pub fn on_efficiency_change(mut self, listener: impl Fn(u16) + Send + Sync + 'static) -> Self {
        self.efficiency = Some(Box::new(listener));
        self
    }

    pub fn on_enabled_change(mut self, listener: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.enabled = Some(Box::new(listener));
        self
    }

    /// Invoked with the new operating mode code of the appliance.
    pub fn on_operating_mode_change(mut self, listener: impl Fn(u16) + Send + Sync + 'static) -> Self {
        self.operating_mode = Some(Box::new(listener));
        self
    }
}

fn notify_unit<T>(listener: &Option<UnitListener<T>>, unit: u8, value: T) {
    if let Some(listener) = listener {
        listener(unit, value);
    }
}

/// The module wide state: the indoor units, the serial line and the operating mode.
pub struct System {
    registers: Arc<dyn Registers>,
}

impl System {
    pub fn new(registers: Arc<dyn Registers>) -> Self {
        Self { registers }
    }

    pub fn watch(&self, listeners: SystemListeners) -> Result<(), Error> {
        let listeners = Arc::new(listeners);
        for unit in 1..=AC_UNITS {
            let on_airflow = Arc::clone(&listeners);
            self.registers.register_callback(
                ac_register(AIRFLOW, unit),
                Arc::new(move |_, word| notify_unit(&on_airflow.airflow, unit, word)),
            )?;
            let on_target = Arc::clone(&listeners);
            self.registers.register_callback(
                ac_register(AC_TARGET_TEMP, unit),
                Arc::new(move |_, word| {
                    let celsius = registers::decode_temperature(word);
                    notify_unit(&on_target.target_temperature, unit, celsius)
                }),
            )?;
            let on_fan = Arc::clone(&listeners);
            self.registers.register_callback(
                ac_register(AC_TARGET_FAN_MODE, unit),
                Arc::new(move |_, word| notify_unit(&on_fan.fan_mode, unit, FanMode::from_code(word))),
            )?;
        }
        let on_efficiency = Arc::clone(&listeners);
        self.registers.register_callback(
            EFFICIENCY,
            Arc::new(move |_, word| notify(&on_efficiency.efficiency, word)),
        )?;
        let on_enabled = Arc::clone(&listeners);
        self.registers.register_callback(
            SYSTEM_ENABLED,
            Arc::new(move |_, word| notify(&on_enabled.enabled, word != 0)),
        )?;
        self.registers.register_callback(
            SYS_OP_MODE,
            Arc::new(move |_, word| notify(&listeners.operating_mode, word)),
        )
    }

    pub fn airflow(&self, unit: u8) -> Result<u16, Error> {
        self.registers.read(ac_register(AIRFLOW, unit))
    }

    pub fn machine_target_temperature(&self, unit: u8) -> Result<f32, Error> {
        self.registers.read(ac_register(AC_TARGET_TEMP, unit)).map(registers::decode_temperature)
    }

    pub fn target_fan_mode(&self, unit: u8) -> Result<Option<FanMode>, Error> {
        self.registers.read(ac_register(AC_TARGET_FAN_MODE, unit)).map(FanMode::from_code)
    }

    /// `None` if the appliance reports a serial configuration that is not known.
    pub fn serial_config(&self) -> Result<Option<SerialConfig>, Error> {
        self.registers.read(SERIAL_CONFIG).map(SerialConfig::from_word)
    }

    /// Serial line speed the appliance is configured for, 0 if unknown.
    pub fn baud_rate(&self) -> Result<u32, Error> {
        Ok(self.serial_config()?.map_or(0, |config| config.baud_rate))
    }

    pub fn parity(&self) -> Result<String, Error> {
        Ok(self.serial_config()?.map_or_else(|| "unknown".to_string(), |config| config.parity.to_string()))
    }

    pub fn slave_id(&self) -> Result<u16, Error> {
        self.registers.read(SLAVE_ID)
    }

    pub fn efficiency(&self) -> Result<u16, Error> {
        self.registers.read(EFFICIENCY)
    }

    pub fn system_enabled(&self) -> Result<bool, Error> {
        self.registers.read(SYSTEM_ENABLED).map(|word| word != 0)
    }

    pub fn operating_mode_code(&self) -> Result<u16, Error> {
        self.registers.read(SYS_OP_MODE)
    }

    pub async fn set_operating_mode_code(&self, code: u16) -> Result<(), Error> {
        self.registers.write(SYS_OP_MODE, code).await?;
        Ok(())
    }

    /// [`HvacMode::Off`] while the system is disabled, otherwise the direction of the operating
    /// mode. `None` for an unknown operating mode.
    pub fn hvac_mode(&self) -> Result<Option<HvacMode>, Error> {
        Ok(modes::hvac_mode(self.system_enabled()?, self.operating_mode_code()?))
    }

    pub fn hold_mode(&self) -> Result<Option<HoldMode>, Error> {
        self.operating_mode_code().map(modes::hold_mode)
    }
}
