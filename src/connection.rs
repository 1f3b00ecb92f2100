//! The fieldbus side: a request/reply holding register interface and its Modbus RTU
//! implementation over a serial port.
//!
//! The serial line is half-duplex, so every operation for every slave goes through a single lock.
//! Failed operations are retried with the port closed and reopened in between, backing off
//! exponentially. After each operation the line is left idle for a little while to respect the
//! inter-frame silence some adapters are sloppy about.

use std::time::Duration;

use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open serial port {1:?}")]
    OpenPort(#[source] tokio_serial::Error, String),
    #[error("modbus request did not complete in {0:?}")]
    Timeout(Duration),
    #[error("modbus request failed")]
    Request(#[source] tokio_modbus::Error),
    #[error("slave responded with exception {0:?}")]
    Exception(tokio_modbus::ExceptionCode),
    #[error("register address {0} is not valid, addresses start at 1")]
    InvalidAddress(u16),
    #[error("slave {0} did not respond")]
    NoResponse(u8),
    #[error("the fieldbus connection has been closed")]
    Closed,
}

/// Request/reply access to holding registers of slaves on a fieldbus.
///
/// Addresses are 1-based; implementations translate to whatever the wire uses.
#[async_trait::async_trait]
pub trait Fieldbus: Send + Sync {
    async fn read_registers(&self, slave: u8, address: u16, count: u16) -> Result<Vec<u16>, Error>;
    /// Returns the value echoed back by the slave.
    async fn write_register(&self, slave: u8, address: u16, value: u16) -> Result<u16, Error>;
    async fn close(&self);
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum Parity {
    #[value(name = "N")]
    None,
    #[value(name = "E")]
    Even,
    #[value(name = "O")]
    Odd,
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "connection::Args")]
pub struct Args {
    /// Serial port where the modbus adapter is connected.
    #[arg(long, default_value = "/dev/ttyUSB0")]
    pub modbus_port: String,

    /// Serial line data rate.
    #[arg(long, default_value = "9600")]
    pub modbus_rate: u32,

    #[arg(long, default_value = "8", value_parser = clap::value_parser!(u8).range(5..=8))]
    pub modbus_data_bits: u8,

    /// The use of no parity usually requires 2 stop bits.
    #[arg(long, value_enum, default_value = "E")]
    pub modbus_parity: Parity,

    #[arg(long, default_value = "1", value_parser = clap::value_parser!(u8).range(1..=2))]
    pub modbus_stop_bits: u8,

    /// Consider a modbus request failed if no response arrives within this time.
    #[arg(long, default_value = "200ms")]
    pub modbus_timeout: humantime::Duration,

    /// How many times an operation is attempted before giving up.
    #[arg(long, default_value = "5")]
    pub modbus_retries: u32,

    /// Delay before the first retry. Doubled for every subsequent retry.
    #[arg(long, default_value = "100ms")]
    pub modbus_retry_delay: humantime::Duration,

    /// Idle time on the line after every operation.
    #[arg(long, default_value = "100ms")]
    pub modbus_throttle: humantime::Duration,
}

impl Args {
    fn open(&self) -> Result<client::Context, Error> {
        let parity = match self.modbus_parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };
        let stop_bits = match self.modbus_stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };
        let data_bits = match self.modbus_data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let builder = tokio_serial::new(&self.modbus_port, self.modbus_rate)
            .parity(parity)
            .stop_bits(stop_bits)
            .data_bits(data_bits);
        let serial = tokio_serial::SerialStream::open(&builder)
            .map_err(|e| Error::OpenPort(e, self.modbus_port.clone()))?;
        debug!(port = self.modbus_port, rate = self.modbus_rate, "opened serial port");
        Ok(rtu::attach(serial))
    }

    fn policy(&self) -> Policy {
        Policy {
            timeout: *self.modbus_timeout,
            attempts: self.modbus_retries,
            retry_delay: *self.modbus_retry_delay,
            throttle: *self.modbus_throttle,
        }
    }
}

/// Timing of operations on the line.
#[derive(Debug, Clone, Copy)]
struct Policy {
    timeout: Duration,
    attempts: u32,
    /// Doubled after every failed attempt.
    retry_delay: Duration,
    throttle: Duration,
}

/// An operation with a 0-based wire address.
#[derive(Debug, Clone, Copy)]
enum Operation {
    GetHoldings { address: u16, count: u16 },
    SetHolding { address: u16, value: u16 },
}

enum Reply {
    Holdings(Vec<u16>),
    Written(u16),
}

/// An open handle on the line.
#[async_trait::async_trait]
trait Transport: Send {
    async fn perform(&mut self, slave: u8, operation: Operation) -> Result<Reply, Error>;
    async fn shutdown(&mut self);
}

#[async_trait::async_trait]
impl Transport for client::Context {
    async fn perform(&mut self, slave: u8, operation: Operation) -> Result<Reply, Error> {
        self.set_slave(Slave(slave));
        match operation {
            Operation::GetHoldings { address, count } => {
                let values = self
                    .read_holding_registers(address, count)
                    .await
                    .map_err(Error::Request)?
                    .map_err(Error::Exception)?;
                Ok(Reply::Holdings(values))
            }
            Operation::SetHolding { address, value } => {
                self.write_single_register(address, value)
                    .await
                    .map_err(Error::Request)?
                    .map_err(Error::Exception)?;
                Ok(Reply::Written(value))
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.disconnect().await {
            debug!(message = "could not close the serial port cleanly", error = %e);
        }
    }
}

type Opener = Box<dyn Fn() -> Result<Box<dyn Transport>, Error> + Send + Sync>;

enum Link {
    Open(Box<dyn Transport>),
    Broken,
    Closed,
}

pub struct Connection {
    port: String,
    policy: Policy,
    opener: Opener,
    link: tokio::sync::Mutex<Link>,
}

fn wire_address(address: u16) -> Result<u16, Error> {
    address.checked_sub(1).ok_or(Error::InvalidAddress(address))
}

impl Connection {
    pub fn open(args: Args) -> Result<Connection, Error> {
        let port = args.modbus_port.clone();
        let policy = args.policy();
        let opener: Opener =
            Box::new(move || args.open().map(|context| Box::new(context) as Box<dyn Transport>));
        let connection = Self::with_opener(port, policy, opener)?;
        info!(port = connection.port, "fieldbus connected");
        Ok(connection)
    }

    fn with_opener(port: String, policy: Policy, opener: Opener) -> Result<Connection, Error> {
        let transport = opener()?;
        Ok(Self { port, policy, opener, link: tokio::sync::Mutex::new(Link::Open(transport)) })
    }

    async fn send(&self, slave: u8, operation: Operation) -> Result<Reply, Error> {
        let Policy { timeout, attempts, retry_delay, throttle } = self.policy;
        let mut link = self.link.lock().await;
        let mut delay = retry_delay;
        let mut attempt = 1;
        let outcome = loop {
            let result = match &mut *link {
                Link::Closed => return Err(Error::Closed),
                Link::Broken => match (self.opener)() {
                    Ok(transport) => {
                        *link = Link::Open(transport);
                        continue;
                    }
                    Err(e) => Err(e),
                },
                Link::Open(transport) => {
                    match tokio::time::timeout(timeout, transport.perform(slave, operation)).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::Timeout(timeout)),
                    }
                }
            };
            match result {
                Ok(reply) => break Ok(reply),
                Err(e) if attempt < attempts => {
                    warn!(
                        message = "retrying modbus operation",
                        port = self.port,
                        slave,
                        ?operation,
                        retries_left = attempts - attempt,
                        error = (&e as &dyn std::error::Error)
                    );
                    if let Link::Open(mut transport) = std::mem::replace(&mut *link, Link::Broken) {
                        transport.shutdown().await;
                    }
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => break Err(e),
            }
        };
        tokio::time::sleep(throttle).await;
        drop(link);
        outcome
    }
}

#[async_trait::async_trait]
impl Fieldbus for Connection {
    async fn read_registers(&self, slave: u8, address: u16, count: u16) -> Result<Vec<u16>, Error> {
        let address = wire_address(address)?;
        match self.send(slave, Operation::GetHoldings { address, count }).await? {
            Reply::Holdings(values) => Ok(values),
            Reply::Written(_) => Err(Error::NoResponse(slave)),
        }
    }

    async fn write_register(&self, slave: u8, address: u16, value: u16) -> Result<u16, Error> {
        let address = wire_address(address)?;
        match self.send(slave, Operation::SetHolding { address, value }).await? {
            Reply::Written(value) => Ok(value),
            Reply::Holdings(_) => Err(Error::NoResponse(slave)),
        }
    }

    async fn close(&self) {
        let mut link = self.link.lock().await;
        if let Link::Open(mut transport) = std::mem::replace(&mut *link, Link::Closed) {
            transport.shutdown().await;
        }
        info!(port = self.port, "fieldbus closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    /// Shared state of a scripted serial line.
    #[derive(Default)]
    struct Line {
        opened: AtomicUsize,
        shut: AtomicUsize,
        failures: AtomicU32,
        hang: AtomicBool,
        attempts: Mutex<Vec<Instant>>,
    }

    struct ScriptedTransport(Arc<Line>);

    #[async_trait::async_trait]
    impl Transport for ScriptedTransport {
        async fn perform(&mut self, slave: u8, operation: Operation) -> Result<Reply, Error> {
            self.0.attempts.lock().unwrap().push(Instant::now());
            if self.0.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.0.failures.load(Ordering::SeqCst) > 0 {
                self.0.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::NoResponse(slave));
            }
            Ok(match operation {
                Operation::GetHoldings { address, count } => {
                    Reply::Holdings((address..address + count).collect())
                }
                Operation::SetHolding { value, .. } => Reply::Written(value),
            })
        }

        async fn shutdown(&mut self) {
            self.0.shut.fetch_add(1, Ordering::SeqCst);
        }
    }

    const POLICY: Policy = Policy {
        timeout: Duration::from_millis(200),
        attempts: 5,
        retry_delay: Duration::from_millis(100),
        throttle: Duration::from_millis(100),
    };

    fn connection(line: &Arc<Line>) -> Connection {
        let line = Arc::clone(line);
        let opener: Opener = Box::new(move || {
            line.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedTransport(Arc::clone(&line))) as Box<dyn Transport>)
        });
        Connection::with_opener("/dev/null".to_string(), POLICY, opener).unwrap()
    }

    /// Attempt times relative to `start`, allowing for millisecond timer rounding.
    fn assert_attempts(line: &Line, start: Instant, expected_ms: &[u64]) {
        let attempts = line.attempts.lock().unwrap();
        let offsets = attempts.iter().map(|at| *at - start).collect::<Vec<_>>();
        assert_eq!(offsets.len(), expected_ms.len(), "{offsets:?}");
        for (offset, &expected) in offsets.iter().zip(expected_ms) {
            let expected = Duration::from_millis(expected);
            assert!(
                *offset >= expected && *offset < expected + Duration::from_millis(5),
                "{offsets:?}"
            );
        }
    }

    fn assert_elapsed(start: Instant, expected_ms: u64) {
        let elapsed = start.elapsed();
        let expected = Duration::from_millis(expected_ms);
        assert!(elapsed >= expected && elapsed < expected + Duration::from_millis(5), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn addresses_are_one_based() {
        let line = Arc::new(Line::default());
        let connection = connection(&line);
        assert_eq!(connection.read_registers(49, 1, 3).await.unwrap(), vec![0, 1, 2]);
        assert_eq!(connection.write_register(49, 82, 6).await.unwrap(), 6);
        assert!(matches!(connection.read_registers(49, 0, 1).await, Err(Error::InvalidAddress(0))));
        assert_eq!(line.attempts.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn operations_are_throttled() {
        let line = Arc::new(Line::default());
        let connection = connection(&line);
        let start = Instant::now();
        connection.read_registers(49, 1, 1).await.unwrap();
        connection.read_registers(50, 1, 1).await.unwrap();
        assert_attempts(&line, start, &[0, 100]);
        assert_elapsed(start, 200);
        assert_eq!(line.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_reopen_the_port_and_back_off() {
        let line = Arc::new(Line::default());
        let connection = connection(&line);
        line.failures.store(3, Ordering::SeqCst);
        let start = Instant::now();
        assert_eq!(connection.read_registers(49, 65, 2).await.unwrap(), vec![64, 65]);
        assert_attempts(&line, start, &[0, 100, 300, 700]);
        assert_elapsed(start, 800);
        assert_eq!(line.opened.load(Ordering::SeqCst), 1 + 3);
        assert_eq!(line.shut.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_last_attempt() {
        let line = Arc::new(Line::default());
        let connection = connection(&line);
        line.failures.store(100, Ordering::SeqCst);
        let start = Instant::now();
        assert!(matches!(connection.write_register(49, 1, 3).await, Err(Error::NoResponse(49))));
        assert_attempts(&line, start, &[0, 100, 300, 700, 1500]);
        assert_elapsed(start, 1600);
        assert_eq!(line.opened.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_slaves_time_out() {
        let line = Arc::new(Line::default());
        let connection = connection(&line);
        line.hang.store(true, Ordering::SeqCst);
        let start = Instant::now();
        let result = connection.read_registers(49, 1, 4).await;
        assert!(matches!(result, Err(Error::Timeout(t)) if t == Duration::from_millis(200)));
        assert_attempts(&line, start, &[0, 300, 700, 1300, 2300]);
        assert_elapsed(start, 2600);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_connection_refuses_requests() {
        let line = Arc::new(Line::default());
        let connection = connection(&line);
        connection.close().await;
        assert_eq!(line.shut.load(Ordering::SeqCst), 1);
        assert!(matches!(connection.read_registers(49, 1, 1).await, Err(Error::Closed)));
        assert!(line.attempts.lock().unwrap().is_empty());
        connection.close().await;
        assert_eq!(line.shut.load(Ordering::SeqCst), 1);
    }
}
