// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A content-addressed, size-bounded, in-memory result cache with
//! at-most-once admission per key.
//!
//! Keys are `Fingerprint`s: strong hashes of a canonical serialization of
//! the full request. Concurrent callers for the same fingerprint attach to
//! the pending computation rather than spawning a second one; a failing
//! computation populates nothing, so the next caller retries.


use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_oncecell::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};

pub const FINGERPRINT_SIZE: usize = 32;

///
/// A strong hash of the full input of a computation, used as a cache key.
///
#[derive(Clone, Copy, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Fingerprint(pub [u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    pub fn of_bytes(bytes: &[u8]) -> Fingerprint {
        let mut hasher = Sha256::default();
        hasher.update(bytes);
        Fingerprint(hasher.finalize().into())
    }

    ///
    /// Fingerprint a value through its canonical JSON serialization.
    ///
    /// Determinism relies on the value serializing its maps in sorted order
    /// (`BTreeMap`) and its sequences in meaningful order, which the broker
    /// request types do.
    ///
    pub fn of_serializable<T: Serialize>(value: &T) -> Result<Fingerprint, String> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| format!("Failed to serialize fingerprint input: {e}"))?;
        Ok(Fingerprint::of_bytes(&bytes))
    }

    #[allow(clippy::wrong_self_convention)]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint<{}>", self.to_hex())
    }
}

///
/// The approximate in-memory footprint of a cached value, used to enforce
/// the cache's total-bytes budget.
///
pub trait Weight {
    fn weight(&self) -> usize;
}

struct Entry<V> {
    value: Arc<V>,
    bytes: usize,
    last_used: u64,
}

struct State<V> {
    entries: HashMap<Fingerprint, Entry<V>>,
    in_flight: HashMap<Fingerprint, Arc<OnceCell<(Arc<V>, bool)>>>,
    total_bytes: usize,
    tick: u64,
}

///
/// The cache. `max_bytes` bounds the sum of entry weights; eviction is
/// approximate-LRU by last-use tick.
///
pub struct ResultCache<V> {
    state: Mutex<State<V>>,
    max_bytes: usize,
}

impl<V: Weight + Send + Sync + 'static> ResultCache<V> {
    pub fn new(max_bytes: usize) -> ResultCache<V> {
        ResultCache {
            state: Mutex::new(State {
                entries: HashMap::new(),
                in_flight: HashMap::new(),
                total_bytes: 0,
                tick: 0,
            }),
            max_bytes,
        }
    }

    pub fn get(&self, key: &Fingerprint) -> Option<Arc<V>> {
        let mut state = self.state.lock();
        state.tick += 1;
        let tick = state.tick;
        state.entries.get_mut(key).map(|entry| {
            entry.last_used = tick;
            entry.value.clone()
        })
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.state.lock().total_bytes
    }

    ///
    /// Look up `key`, or run `compute` to produce it, admitting at most one
    /// concurrent computation per fingerprint: duplicates attach to the
    /// pending result.
    ///
    /// `compute` resolves to `(value, cacheable)`. A non-cacheable value is
    /// returned to every attached caller but is not admitted to the cache.
    /// An error admits nothing, and the next caller retries.
    ///
    pub async fn get_or_compute<E, F, Fut>(&self, key: Fingerprint, compute: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(V, bool), E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        let cell = {
            let mut state = self.state.lock();
            state
                .in_flight
                .entry(key)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let outcome = cell
            .get_or_try_init(async { compute().await.map(|(v, cacheable)| (Arc::new(v), cacheable)) })
            .await
            .cloned();

        // The first finisher publishes (under one lock, so there is no
        // window where the computation is neither pending nor published)
        // and unregisters the flight; errors only unregister.
        let mut state = self.state.lock();
        let still_ours = state
            .in_flight
            .get(&key)
            .map(|existing| Arc::ptr_eq(existing, &cell))
            .unwrap_or(false);
        match &outcome {
            Ok((value, cacheable)) => {
                if *cacheable && !state.entries.contains_key(&key) {
                    Self::insert_locked(&mut state, self.max_bytes, key, value.clone());
                }
                if still_ours {
                    state.in_flight.remove(&key);
                }
            }
            Err(_) => {
                if still_ours && cell.get().is_none() {
                    state.in_flight.remove(&key);
                }
            }
        }
        drop(state);

        outcome.map(|(value, _)| value)
    }

    fn insert_locked(state: &mut State<V>, max_bytes: usize, key: Fingerprint, value: Arc<V>) {
        let bytes = value.weight();
        if bytes > max_bytes {
            log::debug!("Not caching {key}: {bytes} bytes exceeds the whole cache budget");
            return;
        }
        state.tick += 1;
        let tick = state.tick;
        if let Some(old) = state.entries.insert(
            key,
            Entry {
                value,
                bytes,
                last_used: tick,
            },
        ) {
            state.total_bytes -= old.bytes;
        }
        state.total_bytes += bytes;

        while state.total_bytes > max_bytes {
            let Some((&oldest_key, _)) = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
            else {
                break;
            };
            if let Some(evicted) = state.entries.remove(&oldest_key) {
                state.total_bytes -= evicted.bytes;
                log::debug!("Evicted {oldest_key} ({} bytes)", evicted.bytes);
            }
        }
    }
}
