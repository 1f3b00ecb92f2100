//! A cached, change-detecting view over a contiguous window of holding registers of one slave.
//!
//! The cache is refreshed with [`RegisterWindow::poll`]. Callbacks are registered per address
//! and are invoked in ascending address order for every register whose value changed. They run
//! after the new snapshot has been swapped in and after all internal locks have been released,
//! so a callback may freely `read` or `write` the same window.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::trace;

use crate::connection::{self, Fieldbus};

/// Invoked with the address and the new value of a register.
pub type Callback = Arc<dyn Fn(u16, u16) + Send + Sync>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not read registers {window:?} of slave {slave}")]
    Read {
        slave: u8,
        window: Range<u16>,
        #[source]
        source: connection::Error,
    },
    #[error("could not write register {address} of slave {slave}")]
    Write {
        slave: u8,
        address: u16,
        #[source]
        source: connection::Error,
    },
    #[error("slave {slave} returned {actual} registers where {expected} were requested")]
    Shape { slave: u8, expected: u16, actual: usize },
    #[error("cannot grow the window from {current} to {requested} registers")]
    Grow { current: u16, requested: u16 },
    #[error("register {address} is outside of the window {window:?}")]
    Range { address: u16, window: Range<u16> },
    #[error("register {0} was accessed before the window was polled")]
    Uninitialized(u16),
}

impl Error {
    /// Whether the error originates on the wire or in the window's shape, as opposed to an
    /// access outside of what the window currently holds.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Read { .. } | Error::Write { .. } | Error::Shape { .. } | Error::Grow { .. }
        )
    }
}

/// The narrow capability drivers need from a register cache.
#[async_trait::async_trait]
pub trait Registers: Send + Sync {
    fn read(&self, address: u16) -> Result<u16, Error>;
    /// Write a register on the device. The cache reflects the echoed value before the
    /// register's callback is invoked.
    async fn write(&self, address: u16, value: u16) -> Result<u16, Error>;
    fn register_callback(&self, address: u16, callback: Callback) -> Result<(), Error>;
}

struct Snapshot {
    length: u16,
    words: Option<Vec<u16>>,
}

pub struct RegisterWindow {
    slave: u8,
    base: u16,
    fieldbus: Arc<dyn Fieldbus>,
    state: RwLock<Snapshot>,
    callbacks: RwLock<BTreeMap<u16, Callback>>,
}

impl RegisterWindow {
    pub fn new(fieldbus: Arc<dyn Fieldbus>, slave: u8, base: u16, length: u16) -> Self {
        Self {
            slave,
            base,
            fieldbus,
            state: RwLock::new(Snapshot { length, words: None }),
            callbacks: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn slave(&self) -> u8 {
        self.slave
    }

    pub fn window(&self) -> Range<u16> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        self.base..self.base + state.length
    }

    fn check_range(&self, address: u16, length: u16) -> Result<usize, Error> {
        let window = self.base..self.base + length;
        if !window.contains(&address) {
            return Err(Error::Range { address, window });
        }
        Ok(usize::from(address - self.base))
    }

    /// Re-read the whole window from the device and notify about changed registers.
    ///
    /// On the first successful poll every watched register counts as changed.
    pub async fn poll(&self) -> Result<(), Error> {
        let length = self.window().len() as u16;
        if length == 0 {
            // Nothing to ask the device for; a zero count read is an illegal request.
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.words.get_or_insert_with(Vec::new);
            return Ok(());
        }
        let words = self
            .fieldbus
            .read_registers(self.slave, self.base, length)
            .await
            .map_err(|source| Error::Read {
                slave: self.slave,
                window: self.base..self.base + length,
                source,
            })?;
        let fire = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            // Also catches a `resize` that raced with the read above.
            if words.len() != usize::from(state.length) {
                return Err(Error::Shape {
                    slave: self.slave,
                    expected: state.length,
                    actual: words.len(),
                });
            }
            let previous = state.words.replace(words);
            let current = state.words.as_deref().unwrap_or_default();
            let callbacks = self.callbacks.read().unwrap_or_else(PoisonError::into_inner);
            callbacks
                .iter()
                .filter_map(|(&address, callback)| {
                    let index = usize::from(address - self.base);
                    let new = *current.get(index)?;
                    let old = previous.as_ref().and_then(|p| p.get(index).copied());
                    (old != Some(new)).then(|| (Arc::clone(callback), address, new))
                })
                .collect::<Vec<_>>()
        };
        trace!(slave = self.slave, base = self.base, changed = fire.len(), "polled window");
        for (callback, address, value) in fire {
            callback(address, value);
        }
        Ok(())
    }

    pub fn read(&self, address: u16) -> Result<u16, Error> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let index = self.check_range(address, state.length)?;
        let words = state.words.as_ref().ok_or(Error::Uninitialized(address))?;
        Ok(words[index])
    }

    pub async fn write(&self, address: u16, value: u16) -> Result<u16, Error> {
        self.check_range(address, self.window().len() as u16)?;
        let echoed = self
            .fieldbus
            .write_register(self.slave, address, value)
            .await
            .map_err(|source| Error::Write { slave: self.slave, address, source })?;
        let callback = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let length = state.length;
            if let (Ok(index), Some(words)) =
                (self.check_range(address, length), state.words.as_mut())
            {
                words[index] = echoed;
            }
            let callbacks = self.callbacks.read().unwrap_or_else(PoisonError::into_inner);
            callbacks.get(&address).cloned()
        };
        trace!(slave = self.slave, address, value = echoed, "wrote register");
        if let Some(callback) = callback {
            callback(address, echoed);
        }
        Ok(echoed)
    }

    /// Install the callback for an address, replacing any previous one.
    pub fn register_callback(&self, address: u16, callback: Callback) -> Result<(), Error> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        self.check_range(address, state.length)?;
        let mut callbacks = self.callbacks.write().unwrap_or_else(PoisonError::into_inner);
        callbacks.insert(address, callback);
        Ok(())
    }

    /// Invoke every registered callback once with the cached value, in ascending address order.
    pub fn trigger_all(&self) -> Result<(), Error> {
        let fire = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            let callbacks = self.callbacks.read().unwrap_or_else(PoisonError::into_inner);
            let Some(words) = state.words.as_ref() else {
                return Err(Error::Uninitialized(self.base));
            };
            callbacks
                .iter()
                .map(|(&address, callback)| {
                    (Arc::clone(callback), address, words[usize::from(address - self.base)])
                })
                .collect::<Vec<_>>()
        };
        for (callback, address, value) in fire {
            callback(address, value);
        }
        Ok(())
    }

    /// Shrink the window, dropping cached words and callbacks that fall outside of it.
    pub fn resize(&self, length: u16) -> Result<(), Error> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if length > state.length {
            return Err(Error::Grow { current: state.length, requested: length });
        }
        state.length = length;
        if let Some(words) = state.words.as_mut() {
            words.truncate(usize::from(length));
        }
        let end = self.base + length;
        let mut callbacks = self.callbacks.write().unwrap_or_else(PoisonError::into_inner);
        callbacks.retain(|&address, _| address < end);
        Ok(())
    }
}

#[async_trait::async_trait]
impl Registers for RegisterWindow {
    fn read(&self, address: u16) -> Result<u16, Error> {
        RegisterWindow::read(self, address)
    }

    async fn write(&self, address: u16, value: u16) -> Result<u16, Error> {
        RegisterWindow::write(self, address, value).await
    }

    fn register_callback(&self, address: u16, callback: Callback) -> Result<(), Error> {
        RegisterWindow::register_callback(self, address, callback)
    }
}
