//! Instance selection for application-level load balancing.
//!
//! This is independent of [`ConnectionPool`](crate::ConnectionPool): a pool
//! rotates over transport connections to one endpoint, whereas a [`Strategy`]
//! picks one of several [`Instance`]s a caller discovered on its own.
//!
//! Two strategies exist and the set is closed:
//!
//! - [`Strategy::RoundRobin`] walks the list with an atomic cursor
//! - [`Strategy::Hash`] maps a key onto the list, so equal keys land on the
//!   same instance as long as the list does not change
//!
//! A [`Registry`] names strategies so they can be selected from configuration.
//! [`Registry::default`] registers `"round"` and `"hash"`.

use core::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};
use std::collections::HashMap;

/// A `host:port` a request may be sent to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Instance {
    pub host: String,
    pub port: u16,
}

impl Instance {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BalanceError {
    #[error("no instance to choose from")]
    Empty,

    #[error("no balance strategy registered as `{name}`")]
    NotFound { name: String },
}

#[derive(Debug)]
pub enum Strategy {
    /// Cycles through the instances. The cursor is shared by every caller of
    /// this strategy.
    RoundRobin(AtomicUsize),
    /// Picks `crc32(key) % len`. Without a key a random one is drawn.
    Hash,
}

impl Strategy {
    pub const fn round_robin() -> Self {
        Self::RoundRobin(AtomicUsize::new(0))
    }

    /// Chooses one of `instances`.
    ///
    /// # Errors
    ///
    /// Returns [`BalanceError::Empty`] if `instances` is empty.
    pub fn choose<'a>(
        &self,
        instances: &'a [Instance],
        key: Option<&str>,
    ) -> Result<&'a Instance, BalanceError> {
        if instances.is_empty() {
            return Err(BalanceError::Empty);
        }

        let index = match self {
            Self::RoundRobin(cursor) => cursor.fetch_add(1, Ordering::Relaxed) % instances.len(),
            Self::Hash => {
                let hash = match key {
                    Some(key) => hash_key(key),
                    None => rand::random::<u64>(),
                };
                (hash % instances.len() as u64) as usize
            }
        };

        Ok(&instances[index])
    }
}

/// CRC-32 (IEEE) of the key, so every client maps a key the same way.
fn hash_key(key: &str) -> u64 {
    u64::from(crc32fast::hash(key.as_bytes()))
}

/// Named strategies.
#[derive(Debug)]
pub struct Registry {
    strategies: HashMap<String, Strategy>,
}

impl Default for Registry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("round", Strategy::round_robin());
        registry.register("hash", Strategy::Hash);
        registry
    }
}

impl Registry {
    /// A registry with no strategies at all.
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Registers `strategy` under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, strategy: Strategy) {
        self.strategies.insert(name.into(), strategy);
    }

    pub fn get(&self, name: &str) -> Option<&Strategy> {
        self.strategies.get(name)
    }

    /// Chooses an instance with the strategy registered as `name`.
    ///
    /// # Errors
    ///
    /// [`BalanceError::NotFound`] for an unknown name, otherwise whatever
    /// [`Strategy::choose`] returns.
    pub fn select<'a>(
        &self,
        name: &str,
        instances: &'a [Instance],
        key: Option<&str>,
    ) -> Result<&'a Instance, BalanceError> {
        self.get(name)
            .ok_or_else(|| BalanceError::NotFound {
                name: name.to_owned(),
            })?
            .choose(instances, key)
    }
}
