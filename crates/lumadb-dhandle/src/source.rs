//! Data source seam
//!
//! The handle layer never touches pages or files itself. Opening and closing
//! the object behind a handle is delegated to a [`DataSource`]; both calls run
//! with the handle installed as the session's current handle.

use std::any::Any;

use dashmap::DashMap;

use lumadb_common::error::{Error, HandleError, Result};

use crate::handle::HandleKey;
use crate::session::Session;

/// Opaque object owned by an open handle
pub type Underlying = Box<dyn Any + Send + Sync>;

/// Result of opening a data source
pub struct OpenedSource {
    /// Configuration the handle keeps until it is closed
    pub config: String,
    pub underlying: Underlying,
}

impl std::fmt::Debug for OpenedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedSource")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Implementation behind data handles
pub trait DataSource: Send + Sync {
    /// Open the object named by `key`
    fn open(&self, session: &Session, key: &HandleKey) -> Result<OpenedSource>;

    /// Release an object previously returned by [`DataSource::open`]
    fn close(&self, session: &Session, key: &HandleKey, underlying: Underlying) -> Result<()>;
}

/// Object handed out by [`InMemorySource`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryObject {
    pub key: HandleKey,
    /// Number of opens of this key before this one
    pub generation: u64,
}

/// Open/close counters for one key of an [`InMemorySource`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SourceCounters {
    pub opens: u64,
    pub closes: u64,
    /// Opens or closes that ran without the handle as the session's current handle
    pub out_of_context: u64,
}

/// Data source without backing storage.
///
/// Every key opens successfully unless marked failing; opens and closes are
/// counted per key.
#[derive(Debug, Default)]
pub struct InMemorySource {
    counters: DashMap<HandleKey, SourceCounters>,
    configs: DashMap<String, String>,
    failing: DashMap<String, String>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration returned when `name` is opened
    pub fn set_config(&self, name: &str, config: &str) {
        self.configs.insert(name.to_string(), config.to_string());
    }

    /// Make opens of `name` fail with `reason`
    pub fn fail_opens(&self, name: &str, reason: &str) {
        self.failing.insert(name.to_string(), reason.to_string());
    }

    pub fn clear_failure(&self, name: &str) {
        self.failing.remove(name);
    }

    #[must_use]
    pub fn counters(&self, key: &HandleKey) -> SourceCounters {
        self.counters.get(key).map(|c| *c).unwrap_or_default()
    }

    /// Objects currently open
    #[must_use]
    pub fn open_objects(&self) -> u64 {
        self.counters
            .iter()
            .map(|c| c.opens.saturating_sub(c.closes))
            .sum()
    }

    fn in_context(session: &Session, key: &HandleKey) -> bool {
        session
            .current_handle()
            .is_some_and(|current| current.key() == key)
    }
}

impl DataSource for InMemorySource {
    fn open(&self, session: &Session, key: &HandleKey) -> Result<OpenedSource> {
        if let Some(reason) = self.failing.get(&key.name) {
            return Err(Error::Handle(HandleError::OpenFailed {
                name: key.to_string(),
                reason: reason.value().clone(),
            }));
        }

        let in_context = Self::in_context(session, key);
        let mut counters = self.counters.entry(key.clone()).or_default();
        let generation = counters.opens;
        counters.opens += 1;
        if !in_context {
            counters.out_of_context += 1;
        }

        Ok(OpenedSource {
            config: self
                .configs
                .get(&key.name)
                .map(|c| c.value().clone())
                .unwrap_or_default(),
            underlying: Box::new(MemoryObject {
                key: key.clone(),
                generation,
            }),
        })
    }

    fn close(&self, session: &Session, key: &HandleKey, underlying: Underlying) -> Result<()> {
        let object = underlying
            .downcast::<MemoryObject>()
            .map_err(|_| Error::DataSource(format!("foreign object closed for {key}")))?;
        if &object.key != key {
            return Err(Error::DataSource(format!(
                "object for {} closed through {key}",
                object.key
            )));
        }

        let in_context = Self::in_context(session, key);
        let mut counters = self.counters.entry(key.clone()).or_default();
        counters.closes += 1;
        if !in_context {
            counters.out_of_context += 1;
        }
        Ok(())
    }
}
