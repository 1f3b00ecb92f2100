//! Bridges one climate controller module on the fieldbus to the message bus.
//!
//! A [`Bridge`] is started for every message bus session. Starting polls the module, finds the
//! zones that are present, publishes their discovery descriptors and current state, and
//! subscribes to the command topics. From then on [`Bridge::tick`] polls the module and the
//! register callbacks publish whatever changed.
//!
//! Zones are only discovered when a bridge starts; a zone that becomes present later shows up
//! after the next reconnection to the message bus.
//!
//! The zone window is shrunk to end at the last register of the highest present zone, not to
//! four registers per present zone. The two agree when the present zones are numbered
//! contiguously from 1; when they are not, the highest zone would otherwise fall outside the
//! window.

use std::future::Future;
use std::sync::{Arc, Weak};

use futures::FutureExt as _;
use tracing::{debug, info, trace, warn};

use crate::connection::Fieldbus;
use crate::mqtt::{self, MessageBus, MessageHandler};
use crate::register_cache::{self, RegisterWindow, Registers};
use crate::registers::{
    self, FanMode, HoldMode, HvacMode, NUM_ZONES, REGISTERS_PER_ZONE, SYSTEM_WINDOW_BASE,
    SYSTEM_WINDOW_LEN, ZONE_ENABLED, ZONE_WINDOW_BASE, ZONE_WINDOW_LEN, name_or_unknown,
    zone_register,
};

pub mod discovery;
pub mod modes;
mod smoothing;
mod system;
mod zone;

pub use system::{System, SystemListeners};
pub use zone::{Zone, ZoneListeners};

type Listener<T> = Box<dyn Fn(T) + Send + Sync>;

fn notify<T>(listener: &Option<Listener<T>>, value: T) {
    if let Some(listener) = listener {
        listener(value);
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not poll module {module}")]
    Poll {
        module: String,
        #[source]
        source: register_cache::Error,
    },
    #[error("could not access the registers of module {module}")]
    Registers {
        module: String,
        #[source]
        source: register_cache::Error,
    },
    #[error("could not subscribe to the commands for module {module}")]
    Subscribe {
        module: String,
        #[source]
        source: mqtt::Error,
    },
    #[error("bridge for module {0} has not been started")]
    NotStarted(String),
}

/// Topic names of one module.
#[derive(Clone, Debug)]
pub struct Topics {
    prefix: String,
    hass_prefix: String,
    module: String,
}

impl Topics {
    pub fn new(
        prefix: impl Into<String>,
        hass_prefix: impl Into<String>,
        module: impl Into<String>,
    ) -> Self {
        Self { prefix: prefix.into(), hass_prefix: hass_prefix.into(), module: module.into() }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn zone(&self, zone: u8, attribute: &str) -> String {
        format!("{}/{}/zone{zone}/{attribute}", self.prefix, self.module)
    }

    pub fn zone_command(&self, zone: u8, attribute: &str) -> String {
        format!("{}/set", self.zone(zone, attribute))
    }

    pub fn system(&self, attribute: &str) -> String {
        format!("{}/{}/sys/{attribute}", self.prefix, self.module)
    }

    pub fn system_command(&self, attribute: &str) -> String {
        format!("{}/set", self.system(attribute))
    }

    /// Indoor units count from 1.
    pub fn unit(&self, unit: u8, attribute: &str) -> String {
        self.system(&format!("ac{unit}/{attribute}"))
    }

    pub fn discovery(&self, component: &str, object: &str) -> String {
        format!("{}/{component}/{}/{object}/config", self.hass_prefix, self.module)
    }
}

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Name of the module, used in the topic names.
    pub module: String,
    pub slave: u8,
    pub prefix: String,
    pub hass_prefix: String,
}

pub struct Bridge {
    topics: Topics,
    slave: u8,
    fieldbus: Arc<dyn Fieldbus>,
    bus: Arc<dyn MessageBus>,
    session: Option<Arc<Session>>,
}

impl Bridge {
    pub fn new(config: BridgeConfig, fieldbus: Arc<dyn Fieldbus>, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            topics: Topics::new(config.prefix, config.hass_prefix, config.module),
            slave: config.slave,
            fieldbus,
            bus,
            session: None,
        }
    }

    pub fn module(&self) -> &str {
        self.topics.module()
    }

    /// Set the bridge up from scratch, dropping whatever an earlier start set up.
    pub async fn start(&mut self) -> Result<(), Error> {
        self.session = None;
        let module = self.topics.module().to_string();
        info!(module, slave = self.slave, "starting bridge");
        let poll = |source| Error::Poll { module: module.clone(), source };
        let access = |source| Error::Registers { module: module.clone(), source };

        let zone_window = Arc::new(RegisterWindow::new(
            Arc::clone(&self.fieldbus),
            self.slave,
            ZONE_WINDOW_BASE,
            ZONE_WINDOW_LEN,
        ));
        let system_window = Arc::new(RegisterWindow::new(
            Arc::clone(&self.fieldbus),
            self.slave,
            SYSTEM_WINDOW_BASE,
            SYSTEM_WINDOW_LEN,
        ));
        zone_window.poll().await.map_err(poll)?;
        system_window.poll().await.map_err(poll)?;

        let mut present = Vec::new();
        for number in 1..=NUM_ZONES {
            let enabled = zone_window.read(zone_register(number, ZONE_ENABLED)).map_err(access)?;
            if registers::is_present(enabled) {
                present.push(number);
            }
        }
        info!(module, zones = present.len(), "found present zones");
        // Zones are normally contiguous from 1. If they are not, the window still has to reach
        // the last one.
        let covered = present.last().map_or(0, |&last| u16::from(last) * REGISTERS_PER_ZONE);
        zone_window.resize(covered).map_err(access)?;

        let zone_registers: Arc<dyn Registers> = Arc::clone(&zone_window) as _;
        let session = Arc::new(Session {
            topics: self.topics.clone(),
            bus: Arc::clone(&self.bus),
            zones: present.into_iter().map(|n| Zone::new(n, Arc::clone(&zone_registers))).collect(),
            system: System::new(Arc::clone(&system_window) as _),
            zone_window,
            system_window,
        });
        session.watch().map_err(access)?;
        session.subscribe().map_err(|source| Error::Subscribe { module: module.clone(), source })?;
        session.publish_discovery();
        session.zone_window.trigger_all().map_err(access)?;
        session.system_window.trigger_all().map_err(access)?;
        session.publish_static().map_err(access)?;
        self.session = Some(session);
        Ok(())
    }

    /// Poll the module, publishing the changes, and feed the zone temperature averages.
    pub async fn tick(&self) -> Result<(), Error> {
        let module = self.topics.module();
        let Some(session) = &self.session else {
            return Err(Error::NotStarted(module.to_string()));
        };
        let poll = |source| Error::Poll { module: module.to_string(), source };
        session.zone_window.poll().await.map_err(poll)?;
        session.system_window.poll().await.map_err(poll)?;
        for zone in &session.zones {
            zone.sample_temperature()
                .map_err(|source| Error::Registers { module: module.to_string(), source })?;
        }
        Ok(())
    }
}

/// Everything a started bridge sets up. Listeners and command handlers only hold on to the
/// session weakly, so that it goes away together with the bridge.
struct Session {
    topics: Topics,
    bus: Arc<dyn MessageBus>,
    zone_window: Arc<RegisterWindow>,
    system_window: Arc<RegisterWindow>,
    zones: Vec<Zone>,
    system: System,
}

fn weakly<T>(
    session: &Arc<Session>,
    listener: impl Fn(&Session, T) + Send + Sync + 'static,
) -> impl Fn(T) + Send + Sync + 'static {
    let session = Arc::downgrade(session);
    move |value| {
        if let Some(session) = session.upgrade() {
            listener(&session, value);
        }
    }
}

fn weakly_for_unit<T>(
    session: &Arc<Session>,
    listener: impl Fn(&Session, u8, T) + Send + Sync + 'static,
) -> impl Fn(u8, T) + Send + Sync + 'static {
    let session = Arc::downgrade(session);
    move |unit, value| {
        if let Some(session) = session.upgrade() {
            listener(&session, unit, value);
        }
    }
}

fn command<F, Fut>(session: &Arc<Session>, handle: F) -> MessageHandler
where
    F: Fn(Arc<Session>, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let session: Weak<Session> = Arc::downgrade(session);
    Arc::new(move |payload| match session.upgrade() {
        Some(session) => handle(session, payload).boxed(),
        None => futures::future::ready(()).boxed(),
    })
}

impl Session {
    fn module(&self) -> &str {
        self.topics.module()
    }

    fn zone(&self, number: u8) -> Option<&Zone> {
        self.zones.iter().find(|zone| zone.number() == number)
    }

    fn publish(&self, topic: String, payload: impl ToString) {
        if let Err(e) = self.bus.publish(&topic, true, payload.to_string()) {
            warn!(
                message = "could not publish",
                module = self.module(),
                topic,
                error = (&e as &dyn std::error::Error)
            );
        }
    }

    fn report(&self, result: Result<(), register_cache::Error>) {
        if let Err(e) = result {
            warn!(
                message = "could not publish the module state",
                module = self.module(),
                error = (&e as &dyn std::error::Error)
            );
        }
    }

    fn watch(self: &Arc<Self>) -> Result<(), register_cache::Error> {
        for zone in &self.zones {
            zone.watch(self.zone_listeners(zone.number()))?;
        }
        self.system.watch(self.system_listeners())
    }

    fn zone_listeners(self: &Arc<Self>, number: u8) -> ZoneListeners {
        let module = self.module().to_string();
        ZoneListeners::default()
            .on_enabled_change(weakly(self, move |s, on: bool| {
                s.report(s.publish_zone_hvac_mode(number, on))
            }))
            .on_target_temperature_change(weakly(self, move |s, celsius: f32| {
                s.publish(s.topics.zone(number, "targetTemp"), celsius)
            }))
            .on_fan_mode_change(weakly(self, move |s, fan: Option<FanMode>| {
                s.publish(s.topics.zone(number, "fanMode"), name_or_unknown(fan))
            }))
            .on_operating_mode_change(move |code| {
                trace!(module, zone = number, code, "zone operating mode changed")
            })
            .on_current_temperature_change(weakly(self, move |s, celsius: f32| {
                s.publish(s.topics.zone(number, "currentTemp"), celsius)
            }))
    }

    fn system_listeners(self: &Arc<Self>) -> SystemListeners {
        SystemListeners::default()
            .on_airflow_change(weakly_for_unit(self, |s, unit, airflow: u16| {
                s.publish(s.topics.unit(unit, "airflow"), airflow)
            }))
            .on_target_temperature_change(weakly_for_unit(self, |s, unit, celsius: f32| {
                s.publish(s.topics.unit(unit, "targetTemp"), celsius)
            }))
            .on_fan_mode_change(weakly_for_unit(self, |s, unit, fan: Option<FanMode>| {
                s.publish(s.topics.unit(unit, "fanMode"), name_or_unknown(fan))
            }))
            .on_efficiency_change(weakly(self, |s, efficiency: u16| {
                s.publish(s.topics.system("efficiency"), efficiency)
            }))
            .on_enabled_change(weakly(self, |s, enabled: bool| {
                s.publish(s.topics.system("enabled"), enabled);
                s.report(s.publish_hvac_modes());
            }))
            .on_operating_mode_change(weakly(self, |s, code: u16| {
                debug!(
                    module = s.module(),
                    mode = registers::OperatingMode::name_of(code),
                    "operating mode changed"
                );
                s.report(s.publish_hvac_modes());
                s.publish(s.topics.system("holdMode"), name_or_unknown(modes::hold_mode(code)));
            }))
    }

    fn publish_zone_hvac_mode(&self, number: u8, on: bool) -> Result<(), register_cache::Error> {
        let mode = if on { name_or_unknown(self.system.hvac_mode()?) } else { HvacMode::Off.into() };
        self.publish(self.topics.zone(number, "hvacMode"), mode);
        Ok(())
    }

    /// Zones that are switched off stay off whatever the system does.
    fn publish_hvac_modes(&self) -> Result<(), register_cache::Error> {
        let mode = name_or_unknown(self.system.hvac_mode()?);
        for zone in &self.zones {
            if zone.is_on()? {
                self.publish(self.topics.zone(zone.number(), "hvacMode"), mode);
            }
        }
        Ok(())
    }

    fn publish_discovery(&self) {
        for zone in &self.zones {
            for descriptor in [
                discovery::climate(&self.topics, zone.number()),
                discovery::temperature_sensor(&self.topics, zone.number()),
            ] {
                self.publish(descriptor.topic, descriptor.payload);
            }
        }
    }

    fn publish_static(&self) -> Result<(), register_cache::Error> {
        if self.system.serial_config()?.is_none() {
            warn!(module = self.module(), "module reports an unknown serial configuration");
        }
        self.publish(self.topics.system("serialBaud"), self.system.baud_rate()?);
        self.publish(self.topics.system("serialParity"), self.system.parity()?);
        self.publish(self.topics.system("slaveId"), self.system.slave_id()?);
        Ok(())
    }

    fn subscribe(self: &Arc<Self>) -> Result<(), mqtt::Error> {
        for zone in &self.zones {
            let number = zone.number();
            self.bus.subscribe(
                &self.topics.zone_command(number, "targetTemp"),
                command(self, move |s, payload| async move {
                    s.set_target_temperature(number, &payload).await
                }),
            )?;
            self.bus.subscribe(
                &self.topics.zone_command(number, "fanMode"),
                command(self, move |s, payload| async move {
                    s.set_fan_mode(number, &payload).await
                }),
            )?;
            self.bus.subscribe(
                &self.topics.zone_command(number, "hvacMode"),
                command(self, move |s, payload| async move {
                    s.set_hvac_mode(number, &payload).await
                }),
            )?;
        }
        self.bus.subscribe(
            &self.topics.system_command("holdMode"),
            command(self, |s, payload| async move { s.set_hold_mode(&payload).await }),
        )
    }

    async fn set_target_temperature(&self, number: u8, payload: &str) {
        let Some(zone) = self.zone(number) else { return };
        let celsius = match payload.trim().parse::<f32>() {
            Ok(celsius) if celsius.is_finite() => celsius,
            _ => {
                warn!(module = self.module(), zone = number, payload, "ignoring invalid target temperature");
                return;
            }
        };
        if let Err(e) = zone.set_target_temperature(celsius).await {
            warn!(
                message = "could not set the target temperature",
                module = self.module(),
                zone = number,
                celsius,
                error = (&e as &dyn std::error::Error)
            );
        }
    }

    async fn set_fan_mode(&self, number: u8, payload: &str) {
        let Some(zone) = self.zone(number) else { return };
        let Ok(fan) = payload.trim().parse::<FanMode>() else {
            warn!(module = self.module(), zone = number, payload, "ignoring unknown fan mode");
            return;
        };
        if let Err(e) = zone.set_fan_mode(fan).await {
            warn!(
                message = "could not set the fan mode",
                module = self.module(),
                zone = number,
                %fan,
                error = (&e as &dyn std::error::Error)
            );
        }
    }

    async fn set_hvac_mode(&self, number: u8, payload: &str) {
        let Some(zone) = self.zone(number) else { return };
        let Ok(mode) = payload.trim().parse::<HvacMode>() else {
            warn!(module = self.module(), zone = number, payload, "ignoring unknown HVAC mode");
            return;
        };
        let result = match mode {
            HvacMode::Off => zone.set_on(false).await,
            mode => match self.change_operating_mode(|code| modes::apply_hvac_mode(code, mode)).await {
                Ok(()) => zone.set_on(true).await,
                Err(e) => Err(e),
            },
        };
        if let Err(e) = result {
            warn!(
                message = "could not set the HVAC mode",
                module = self.module(),
                zone = number,
                %mode,
                error = (&e as &dyn std::error::Error)
            );
        }
    }

    async fn set_hold_mode(&self, payload: &str) {
        let Ok(hold) = payload.trim().parse::<HoldMode>() else {
            warn!(module = self.module(), payload, "ignoring unknown hold mode");
            return;
        };
        if let Err(e) = self.change_operating_mode(|code| modes::apply_hold_mode(code, hold)).await {
            warn!(
                message = "could not set the hold mode",
                module = self.module(),
                %hold,
                error = (&e as &dyn std::error::Error)
            );
        }
    }

    /// Write the system operating mode, if the new one differs from the current one.
    async fn change_operating_mode(
        &self,
        change: impl FnOnce(u16) -> u16,
    ) -> Result<(), register_cache::Error> {
        let current = self.system.operating_mode_code()?;
        let new = change(current);
        if new != current {
            debug!(module = self.module(), current, new, "changing operating mode");
            self.system.set_operating_mode_code(new).await?;
        }
        Ok(())
    }
}
