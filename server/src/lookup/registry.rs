//! Registration database
//!
//! The triple-keyed index behind the lookup daemon: `(category, key, subkey)`
//! maps to the set of producers hosting that registration. One read-write
//! lock guards the whole map; reads vastly outnumber writes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;

use crate::utils::names::is_ephemeral;

/// The only wildcard recognized by queries. Writes never accept it; an empty
/// string in a query matches only an empty value.
pub const WILDCARD: &str = "*";

/// A single registration key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Registration {
    pub category: String,
    pub key: String,
    pub subkey: String,
}

impl Registration {
    pub fn new(
        category: impl Into<String>,
        key: impl Into<String>,
        subkey: impl Into<String>,
    ) -> Self {
        Self {
            category: category.into(),
            key: key.into(),
            subkey: subkey.into(),
        }
    }
}

/// Static identity of a producer, as announced via `IDENTIFY`.
#[derive(Debug, Clone, Serialize)]
pub struct ProducerInfo {
    /// Connection identity (remote address); not exposed in query results
    #[serde(skip)]
    pub id: String,
    pub address: String,
    pub tcp_port: u16,
    pub http_port: u16,
    pub version: String,
}

/// A producer record shared across every registration it appears under, so a
/// `PING` refreshes its liveness everywhere at once.
#[derive(Debug)]
pub struct Producer {
    pub info: ProducerInfo,
    /// Unix milliseconds of the last PING or IDENTIFY
    last_update: AtomicI64,
}

impl Producer {
    pub fn new(info: ProducerInfo) -> Arc<Self> {
        Arc::new(Self {
            info,
            last_update: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
        })
    }

    /// Refresh the liveness timestamp.
    pub fn touch(&self) {
        self.last_update
            .store(chrono::Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    pub fn last_update_ms(&self) -> i64 {
        self.last_update.load(Ordering::SeqCst)
    }

    pub fn is_active(&self, within: Duration) -> bool {
        let age = chrono::Utc::now().timestamp_millis() - self.last_update_ms();
        age <= within.as_millis() as i64
    }
}

fn matches(query: &str, value: &str) -> bool {
    query == WILDCARD || query == value
}

/// The registration index.
pub struct RegistrationDb {
    inner: RwLock<HashMap<Registration, HashMap<String, Arc<Producer>>>>,
    inactive_timeout: Duration,
}

impl RegistrationDb {
    pub fn new(inactive_timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            inactive_timeout,
        }
    }

    /// Idempotent set-insert.
    pub fn add(&self, registration: Registration, producer: Arc<Producer>) {
        self.inner
            .write()
            .entry(registration)
            .or_default()
            .insert(producer.info.id.clone(), producer);
    }

    /// Remove a producer from a registration, returning how many producers
    /// remain under it. An ephemeral channel registration that just lost its
    /// last producer is deleted outright.
    pub fn remove(&self, registration: &Registration, producer_id: &str) -> usize {
        let mut inner = self.inner.write();
        let Some(producers) = inner.get_mut(registration) else {
            return 0;
        };
        producers.remove(producer_id);
        let remaining = producers.len();
        if remaining == 0
            && registration.category == "channel"
            && is_ephemeral(&registration.subkey)
        {
            inner.remove(registration);
        }
        remaining
    }

    /// Delete a registration key entirely.
    pub fn remove_registration(&self, registration: &Registration) {
        self.inner.write().remove(registration);
    }

    /// All registrations matching the query; `*` matches any key/subkey.
    pub fn find_registrations(
        &self,
        category: &str,
        key: &str,
        subkey: &str,
    ) -> Vec<Registration> {
        self.inner
            .read()
            .keys()
            .filter(|r| {
                r.category == category && matches(key, &r.key) && matches(subkey, &r.subkey)
            })
            .cloned()
            .collect()
    }

    /// Union of active producers across all matching registrations.
    pub fn find_producers(&self, category: &str, key: &str, subkey: &str) -> Vec<Arc<Producer>> {
        let inner = self.inner.read();
        let mut seen = HashMap::new();
        for (registration, producers) in inner.iter() {
            if registration.category != category
                || !matches(key, &registration.key)
                || !matches(subkey, &registration.subkey)
            {
                continue;
            }
            for (id, producer) in producers {
                if producer.is_active(self.inactive_timeout) {
                    seen.entry(id.clone()).or_insert_with(|| Arc::clone(producer));
                }
            }
        }
        let mut producers: Vec<Arc<Producer>> = seen.into_values().collect();
        producers.sort_by(|a, b| a.info.id.cmp(&b.info.id));
        producers
    }

    /// Reverse lookup: every registration containing this producer.
    pub fn lookup_registrations(&self, producer_id: &str) -> Vec<Registration> {
        self.inner
            .read()
            .iter()
            .filter(|(_, producers)| producers.contains_key(producer_id))
            .map(|(registration, _)| registration.clone())
            .collect()
    }
}
