//! In-memory stand-ins for the fieldbus and the message bus.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::connection::{self, Fieldbus};
use crate::mqtt::{self, MessageBus, MessageHandler};
use crate::register_cache::{self, Callback, Registers};

/// Register image of a module with ten present zones followed by six absent ones, then the
/// system block: unit 1 blowing at airflow 2 towards 22°C on auto, 9600 baud with even parity,
/// slave id 49, efficiency 3, system enabled in air cooling mode.
pub fn module_image() -> Vec<u16> {
    let mut image = vec![
        3, 68, 41, 41, 3, 68, 41, 41, 3, 68, 41, 45, 3, 68, 41, 45, 3, 68, 41, 42, 3, 52, 41, 40,
        3, 52, 41, 44, 3, 68, 41, 41, 3, 68, 41, 40, 3, 68, 41, 41, 0, 68, 0, 0, 0, 68, 0, 0, 0,
        68, 0, 0, 0, 68, 0, 0, 0, 68, 0, 0, 0, 68, 0, 0,
    ];
    image.extend([2, 0, 0, 0, 44, 0, 0, 0, 4, 0, 0, 0, 2, 49, 3, 0, 1, 0x01]);
    image
}

#[derive(Default)]
pub struct MemoryFieldbus {
    slaves: Mutex<HashMap<u8, Vec<u16>>>,
    writes: Mutex<Vec<(u8, u16, u16)>>,
    failing: AtomicBool,
    truncate: Mutex<Option<usize>>,
}

impl MemoryFieldbus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_slave(&self, slave: u8, image: Vec<u16>) {
        self.slaves.lock().unwrap().insert(slave, image);
    }

    pub fn set(&self, slave: u8, address: u16, value: u16) {
        self.slaves.lock().unwrap().get_mut(&slave).unwrap()[usize::from(address - 1)] = value;
    }

    pub fn get(&self, slave: u8, address: u16) -> u16 {
        self.slaves.lock().unwrap()[&slave][usize::from(address - 1)]
    }

    pub fn take_writes(&self) -> Vec<(u8, u16, u16)> {
        std::mem::take(&mut *self.writes.lock().unwrap())
    }

    pub fn fail_requests(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn truncate_reads(&self, count: Option<usize>) {
        *self.truncate.lock().unwrap() = count;
    }
}

#[async_trait::async_trait]
impl Fieldbus for MemoryFieldbus {
    async fn read_registers(
        &self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, connection::Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(connection::Error::NoResponse(slave));
        }
        let slaves = self.slaves.lock().unwrap();
        let image = slaves.get(&slave).ok_or(connection::Error::NoResponse(slave))?;
        let start = usize::from(address - 1);
        let mut words = image[start..start + usize::from(count)].to_vec();
        if let Some(count) = *self.truncate.lock().unwrap() {
            words.truncate(count);
        }
        Ok(words)
    }

    async fn write_register(
        &self,
        slave: u8,
        address: u16,
        value: u16,
    ) -> Result<u16, connection::Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(connection::Error::NoResponse(slave));
        }
        let mut slaves = self.slaves.lock().unwrap();
        let image = slaves.get_mut(&slave).ok_or(connection::Error::NoResponse(slave))?;
        image[usize::from(address - 1)] = value;
        self.writes.lock().unwrap().push((slave, address, value));
        Ok(value)
    }

    async fn close(&self) {}
}

/// A register map that fires callbacks on writes only.
#[derive(Default)]
pub struct StubRegisters {
    words: Mutex<BTreeMap<u16, u16>>,
    callbacks: Mutex<BTreeMap<u16, Callback>>,
}

impl StubRegisters {
    pub fn with(words: impl IntoIterator<Item = (u16, u16)>) -> Self {
        Self { words: Mutex::new(words.into_iter().collect()), ..Default::default() }
    }

    pub fn set(&self, address: u16, value: u16) {
        self.words.lock().unwrap().insert(address, value);
    }

    /// Simulate a poll that observed `value` at `address`.
    pub fn change(&self, address: u16, value: u16) {
        self.set(address, value);
        let callback = self.callbacks.lock().unwrap().get(&address).cloned();
        if let Some(callback) = callback {
            callback(address, value);
        }
    }

    pub fn watched(&self) -> Vec<u16> {
        self.callbacks.lock().unwrap().keys().copied().collect()
    }
}

#[async_trait::async_trait]
impl Registers for StubRegisters {
    fn read(&self, address: u16) -> Result<u16, register_cache::Error> {
        self.words
            .lock()
            .unwrap()
            .get(&address)
            .copied()
            .ok_or(register_cache::Error::Uninitialized(address))
    }

    async fn write(&self, address: u16, value: u16) -> Result<u16, register_cache::Error> {
        self.change(address, value);
        Ok(value)
    }

    fn register_callback(
        &self,
        address: u16,
        callback: Callback,
    ) -> Result<(), register_cache::Error> {
        self.callbacks.lock().unwrap().insert(address, callback);
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub topic: String,
    pub retained: bool,
    pub payload: String,
}

pub struct RecordingBus {
    messages: Mutex<Vec<Message>>,
    handlers: Mutex<BTreeMap<String, MessageHandler>>,
    session: Mutex<Option<u64>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            handlers: Mutex::new(BTreeMap::new()),
            session: Mutex::new(Some(1)),
        }
    }

    pub fn set_session(&self, session: Option<u64>) {
        *self.session.lock().unwrap() = session;
    }

    pub fn take(&self) -> Vec<Message> {
        std::mem::take(&mut *self.messages.lock().unwrap())
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    pub fn on(&self, topic: &str) -> Vec<String> {
        let messages = self.messages.lock().unwrap();
        messages.iter().filter(|m| m.topic == topic).map(|m| m.payload.clone()).collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.handlers.lock().unwrap().keys().cloned().collect()
    }

    /// Deliver a message to the subscriber of `topic`, as the broker would.
    pub async fn deliver(&self, topic: &str, payload: &str) {
        let handler = self.handlers.lock().unwrap().get(topic).cloned();
        if let Some(handler) = handler {
            handler(payload.to_string()).await;
        }
    }
}

impl MessageBus for RecordingBus {
    fn publish(&self, topic: &str, retained: bool, payload: String) -> Result<(), mqtt::Error> {
        self.messages.lock().unwrap().push(Message {
            topic: topic.to_string(),
            retained,
            payload,
        });
        Ok(())
    }

    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), mqtt::Error> {
        self.handlers.lock().unwrap().insert(topic.to_string(), handler);
        Ok(())
    }

    fn session_id(&self) -> Option<u64> {
        *self.session.lock().unwrap()
    }

    fn close(&self) {}
}
