pub mod bridge {
    use std::future::Future;
    use std::sync::Arc;

    use tracing::{info, warn};

    use crate::climate::{Bridge, BridgeConfig};
    use crate::connection::{self, Connection, Fieldbus};
    use crate::mqtt::{self, MessageBus, MqttBus};
    use crate::poller::Poller;

    /// Bridge the climate controller modules to MQTT until interrupted.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        mqtt: mqtt::Args,
        /// Modbus slave ids of the modules to bridge.
        #[arg(long, value_delimiter = ',', default_value = "49")]
        slave_ids: Vec<u8>,
        /// Names of the modules, in the same order as the slave ids. Used in the topic names.
        ///
        /// Defaults to `<hostname>_<port>_<slave id>`.
        #[arg(long, value_delimiter = ',')]
        slave_names: Vec<String>,
        /// How often the modules are polled.
        #[arg(long, default_value = "1s")]
        poll_interval: humantime::Duration,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("{names} slave names were given for {ids} slave ids")]
        SlaveNames { ids: usize, names: usize },
        #[error("could not set up the fieldbus connection")]
        Connection(#[source] connection::Error),
        #[error("could not set up the MQTT connection")]
        Mqtt(#[source] mqtt::Error),
        #[error("could not listen for termination signals")]
        Signal(#[source] std::io::Error),
    }

    impl Args {
        fn modules(&self) -> Result<Vec<(u8, String)>, Error> {
            let names = if self.slave_names.is_empty() {
                let port = &self.connection.modbus_port;
                self.slave_ids.iter().map(|&slave| generate_node_name(port, slave)).collect()
            } else if self.slave_names.len() != self.slave_ids.len() {
                return Err(Error::SlaveNames {
                    ids: self.slave_ids.len(),
                    names: self.slave_names.len(),
                });
            } else {
                self.slave_names.clone()
            };
            Ok(self.slave_ids.iter().copied().zip(names).collect())
        }
    }

    /// A module name unique to this machine and serial port.
    pub fn generate_node_name(port: &str, slave: u8) -> String {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        node_name(&hostname, port, slave)
    }

    fn node_name(hostname: &str, port: &str, slave: u8) -> String {
        let port = port
            .replace("/dev/", "")
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect::<String>();
        format!("{hostname}_{port}_{slave}").to_lowercase()
    }

    fn shutdown_signal() -> Result<impl Future<Output = ()>, Error> {
        #[cfg(unix)]
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .map_err(Error::Signal)?;
        Ok(async move {
            #[cfg(unix)]
            let terminate = terminate.recv();
            #[cfg(not(unix))]
            let terminate = std::future::pending::<Option<()>>();
            tokio::select! {
                result = tokio::signal::ctrl_c() => match result {
                    Ok(()) => info!("received an interrupt, shutting down"),
                    Err(e) => warn!(
                        message = "could not listen for interrupts, shutting down",
                        error = (&e as &dyn std::error::Error)
                    ),
                },
                _ = terminate => info!("received a termination request, shutting down"),
            }
        })
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let modules = args.modules()?;
        let shutdown = shutdown_signal()?;
        let fieldbus: Arc<dyn Fieldbus> =
            Arc::new(Connection::open(args.connection.clone()).map_err(Error::Connection)?);
        let bus: Arc<dyn MessageBus> = Arc::new(MqttBus::connect(&args.mqtt).map_err(Error::Mqtt)?);
        let bridges = modules
            .into_iter()
            .map(|(slave, module)| {
                info!(slave, module, "bridging module");
                let config = BridgeConfig {
                    module,
                    slave,
                    prefix: args.mqtt.prefix.clone(),
                    hass_prefix: args.mqtt.hass_prefix.clone(),
                };
                Bridge::new(config, Arc::clone(&fieldbus), Arc::clone(&bus))
            })
            .collect();
        let mut poller = Poller::new(bridges, Arc::clone(&bus));
        poller.run(*args.poll_interval, shutdown).await;
        drop(poller);
        bus.close();
        fieldbus.close().await;
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use clap::Parser as _;

        #[test]
        fn node_names_are_sanitised() {
            assert_eq!(node_name("Kitchen-Pi", "/dev/ttyUSB0", 49), "kitchen-pi_ttyusb0_49");
            assert_eq!(node_name("host", "/dev/serial/by-id/usb-FTDI_1", 7), "host_serialbyidusbftdi1_7");
        }

        #[test]
        fn default_module_names() {
            let args = Args::parse_from(["bridge", "--slave-ids", "49,50"]);
            let modules = args.modules().unwrap();
            assert_eq!(modules.len(), 2);
            assert_eq!(modules[0].0, 49);
            assert!(modules[0].1.ends_with("_ttyusb0_49"));
            assert!(modules[1].1.ends_with("_ttyusb0_50"));
            assert_eq!(*args.poll_interval, std::time::Duration::from_secs(1));
        }

        #[test]
        fn explicit_module_names() {
            let args = Args::parse_from(["bridge", "--slave-ids", "49,50", "--slave-names", "up,down"]);
            assert_eq!(
                args.modules().unwrap(),
                vec![(49, "up".to_string()), (50, "down".to_string())]
            );
            let args = Args::parse_from(["bridge", "--slave-names", "up,down"]);
            assert!(matches!(args.modules(), Err(Error::SlaveNames { ids: 1, names: 2 })));
            assert!(Args::try_parse_from(["bridge", "--slave-ids", "49,300"]).is_err());
        }
    }
}

pub mod read {
    use std::sync::Arc;

    use crate::climate::{System, Zone};
    use crate::connection::{self, Connection, Fieldbus};
    use crate::output;
    use crate::register_cache::{self, RegisterWindow};
    use crate::registers::{
        self, AC_UNITS, NUM_ZONES, OperatingMode, SYSTEM_WINDOW_BASE, SYSTEM_WINDOW_LEN,
        ZONE_ENABLED, ZONE_WINDOW_BASE, ZONE_WINDOW_LEN, name_or_unknown, zone_register,
    };

    #[derive(clap::ValueEnum, Clone, Copy, Debug)]
    pub enum Section {
        Zones,
        System,
    }

    /// Read the current state of the modules once.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
        /// Modbus slave ids of the modules to read.
        #[arg(long, value_delimiter = ',', default_value = "49")]
        slave_ids: Vec<u8>,
        #[arg(value_enum, default_value_t = Section::Zones)]
        section: Section,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not set up the fieldbus connection")]
        Connection(#[source] connection::Error),
        #[error("could not read slave {1}")]
        Read(#[source] register_cache::Error, u8),
        #[error("could not output the results")]
        Output(#[from] output::Error),
    }

    #[derive(serde::Serialize, Debug, PartialEq)]
    pub struct ZoneRecord {
        pub slave: u8,
        pub zone: u8,
        pub on: bool,
        pub target_temperature: f32,
        pub current_temperature: f32,
        pub fan_mode: &'static str,
        pub operating_mode: String,
    }

    #[derive(serde::Serialize, Debug, PartialEq)]
    pub struct SystemRecord {
        pub slave: u8,
        pub name: String,
        pub value: String,
    }

    async fn window(
        fieldbus: &Arc<dyn Fieldbus>,
        slave: u8,
        base: u16,
        length: u16,
    ) -> Result<Arc<RegisterWindow>, Error> {
        let window = Arc::new(RegisterWindow::new(Arc::clone(fieldbus), slave, base, length));
        window.poll().await.map_err(|e| Error::Read(e, slave))?;
        Ok(window)
    }

    pub async fn zones(fieldbus: &Arc<dyn Fieldbus>, slave: u8) -> Result<Vec<ZoneRecord>, Error> {
        let window = window(fieldbus, slave, ZONE_WINDOW_BASE, ZONE_WINDOW_LEN).await?;
        let read = |e| Error::Read(e, slave);
        let mut records = Vec::new();
        for number in 1..=NUM_ZONES {
            let enabled = window.read(zone_register(number, ZONE_ENABLED)).map_err(read)?;
            if !registers::is_present(enabled) {
                continue;
            }
            let zone = Zone::new(number, Arc::clone(&window) as _);
            records.push(ZoneRecord {
                slave,
                zone: number,
                on: zone.is_on().map_err(read)?,
                target_temperature: zone.target_temperature().map_err(read)?,
                current_temperature: zone.current_temperature().map_err(read)?,
                fan_mode: name_or_unknown(zone.fan_mode().map_err(read)?),
                operating_mode: OperatingMode::name_of(zone.operating_mode_code().map_err(read)?),
            });
        }
        Ok(records)
    }

    pub async fn system(fieldbus: &Arc<dyn Fieldbus>, slave: u8) -> Result<Vec<SystemRecord>, Error> {
        let window = window(fieldbus, slave, SYSTEM_WINDOW_BASE, SYSTEM_WINDOW_LEN).await?;
        let system = System::new(window as _);
        let read = |e| Error::Read(e, slave);
        let values = vec![
            ("enabled", system.system_enabled().map_err(read)?.to_string()),
            ("operating mode", OperatingMode::name_of(system.operating_mode_code().map_err(read)?)),
            ("hvac mode", name_or_unknown(system.hvac_mode().map_err(read)?).to_string()),
            ("hold mode", name_or_unknown(system.hold_mode().map_err(read)?).to_string()),
            ("efficiency", system.efficiency().map_err(read)?.to_string()),
            ("slave id", system.slave_id().map_err(read)?.to_string()),
            ("serial baud", system.baud_rate().map_err(read)?.to_string()),
            ("serial parity", system.parity().map_err(read)?),
        ];
        let mut records = values
            .into_iter()
            .map(|(name, value)| SystemRecord { slave, name: name.to_string(), value })
            .collect::<Vec<_>>();
        for unit in 1..=AC_UNITS {
            let unit_values = [
                ("airflow", system.airflow(unit).map_err(read)?.to_string()),
                ("target temp", system.machine_target_temperature(unit).map_err(read)?.to_string()),
                ("fan mode", name_or_unknown(system.target_fan_mode(unit).map_err(read)?).to_string()),
            ];
            records.extend(unit_values.into_iter().map(|(name, value)| SystemRecord {
                slave,
                name: format!("ac{unit} {name}"),
                value,
            }));
        }
        Ok(records)
    }

    impl output::Record for ZoneRecord {
        const COLUMNS: &'static [&'static str] =
            &["Slave", "Zone", "On", "Target", "Current", "Fan", "Mode"];

        fn cells(&self) -> Vec<String> {
            vec![
                self.slave.to_string(),
                self.zone.to_string(),
                self.on.to_string(),
                self.target_temperature.to_string(),
                self.current_temperature.to_string(),
                self.fan_mode.to_string(),
                self.operating_mode.clone(),
            ]
        }
    }

    impl output::Record for SystemRecord {
        const COLUMNS: &'static [&'static str] = &["Slave", "Name", "Value"];

        fn cells(&self) -> Vec<String> {
            vec![self.slave.to_string(), self.name.clone(), self.value.clone()]
        }
    }

    async fn emit_zones(
        fieldbus: &Arc<dyn Fieldbus>,
        slave_ids: &[u8],
        mut output: output::Output<ZoneRecord>,
    ) -> Result<(), Error> {
        for &slave in slave_ids {
            for record in zones(fieldbus, slave).await? {
                output.emit(&record)?;
            }
        }
        Ok(output.finish()?)
    }

    async fn emit_system(
        fieldbus: &Arc<dyn Fieldbus>,
        slave_ids: &[u8],
        mut output: output::Output<SystemRecord>,
    ) -> Result<(), Error> {
        for &slave in slave_ids {
            for record in system(fieldbus, slave).await? {
                output.emit(&record)?;
            }
        }
        Ok(output.finish()?)
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let fieldbus: Arc<dyn Fieldbus> =
            Arc::new(Connection::open(args.connection).map_err(Error::Connection)?);
        let result = match args.section {
            Section::Zones => match args.output.open() {
                Ok(output) => emit_zones(&fieldbus, &args.slave_ids, output).await,
                Err(e) => Err(e.into()),
            },
            Section::System => match args.output.open() {
                Ok(output) => emit_system(&fieldbus, &args.slave_ids, output).await,
                Err(e) => Err(e.into()),
            },
        };
        fieldbus.close().await;
        result
    }

}

pub mod registers {
    use crate::output::{self, Record};
    use crate::registers::RegisterSchema;

    /// Search and output the known holding registers.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        output: output::Args,
        /// Only list registers whose name, description or address contains this.
        filter: Option<String>,
    }

    impl Record for RegisterSchema {
        const COLUMNS: &'static [&'static str] = &["Address", "Name", "Description"];

        fn cells(&self) -> Vec<String> {
            vec![self.address.to_string(), self.name.clone(), self.description.to_string()]
        }
    }

    pub fn run(args: Args) -> Result<(), output::Error> {
        let mut output = args.output.open::<RegisterSchema>()?;
        let registers = RegisterSchema::all_registers()
            .filter(|r| args.filter.as_deref().is_none_or(|pattern| r.is_match(pattern)));
        for register in registers {
            output.emit(&register)?;
        }
        output.finish()
    }
}
