//! The keyspace: a flat map from key to value with lazy expiry.
//!
//! Expired keys are dropped when they are touched. Serialized dumps carry
//! the remaining TTL rather than an absolute deadline, since deadlines come
//! from a process-local monotonic clock and mean nothing on another node.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::time::{self, NO_EXPIRY};

/// A stored value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Str(Bytes),
    List(VecDeque<Bytes>),
}

/// TTL status of a key, Redis style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlResult {
    NotFound,
    NoExpiry,
    Milliseconds(u64),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at_ms: u64,
}

impl Entry {
    fn is_expired(&self) -> bool {
        time::is_past(self.expires_at_ms)
    }
}

/// On-the-wire form produced by [`Keyspace::dump`].
#[derive(Serialize, Deserialize)]
struct Dump {
    value: Value,
    ttl_ms: Option<u64>,
}

#[derive(Debug, Default)]
pub struct Keyspace {
    entries: HashMap<Bytes, Entry>,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops `key` if it has expired. Returns `true` when it was removed.
    fn remove_if_expired(&mut self, key: &[u8]) -> bool {
        let expired = self.entries.get(key).is_some_and(Entry::is_expired);
        if expired {
            self.entries.remove(key);
        }
        expired
    }

    fn live(&mut self, key: &[u8]) -> Option<&mut Entry> {
        if self.remove_if_expired(key) {
            return None;
        }
        self.entries.get_mut(key)
    }

    /// Returns the string at `key`.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>, EngineError> {
        match self.live(key) {
            Some(Entry {
                value: Value::Str(b),
                ..
            }) => Ok(Some(b.clone())),
            Some(_) => Err(EngineError::WrongType),
            None => Ok(None),
        }
    }

    /// Stores a string, replacing whatever was there. `ttl_ms` of `None`
    /// clears any previous expiry.
    pub fn set(&mut self, key: Bytes, value: Bytes, ttl_ms: Option<u64>) {
        let expires_at_ms = ttl_ms.map(time::deadline_after).unwrap_or(NO_EXPIRY);
        self.entries.insert(
            key,
            Entry {
                value: Value::Str(value),
                expires_at_ms,
            },
        );
    }

    pub fn exists(&mut self, key: &[u8]) -> bool {
        self.live(key).is_some()
    }

    pub fn del(&mut self, key: &[u8]) -> bool {
        if self.remove_if_expired(key) {
            return false;
        }
        self.entries.remove(key).is_some()
    }

    pub fn pttl(&mut self, key: &[u8]) -> TtlResult {
        match self.live(key) {
            Some(entry) => match time::ms_until(entry.expires_at_ms) {
                Some(ms) => TtlResult::Milliseconds(ms),
                None => TtlResult::NoExpiry,
            },
            None => TtlResult::NotFound,
        }
    }

    /// Moves `key` to `newkey`, keeping its expiry. An existing `newkey`
    /// is overwritten.
    pub fn rename(&mut self, key: &[u8], newkey: Bytes) -> Result<(), EngineError> {
        self.remove_if_expired(key);
        let entry = self.entries.remove(key).ok_or(EngineError::NoSuchKey)?;
        self.entries.insert(newkey, entry);
        Ok(())
    }

    /// Pushes values onto a list, creating it if needed. Returns the new length.
    pub fn push(&mut self, key: Bytes, values: &[Bytes], front: bool) -> Result<usize, EngineError> {
        self.remove_if_expired(&key);
        let entry = self.entries.entry(key).or_insert_with(|| Entry {
            value: Value::List(VecDeque::new()),
            expires_at_ms: NO_EXPIRY,
        });
        let Value::List(list) = &mut entry.value else {
            return Err(EngineError::WrongType);
        };
        for v in values {
            if front {
                list.push_front(v.clone());
            } else {
                list.push_back(v.clone());
            }
        }
        Ok(list.len())
    }

    /// Returns the elements between `start` and `stop` inclusive. Negative
    /// indices count from the tail.
    pub fn range(&mut self, key: &[u8], start: i64, stop: i64) -> Result<Vec<Bytes>, EngineError> {
        let list = match self.live(key) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => list,
            Some(_) => return Err(EngineError::WrongType),
            None => return Ok(Vec::new()),
        };
        let len = list.len() as i64;
        let norm = |i: i64| if i < 0 { (len + i).max(0) } else { i };
        let (start, stop) = (norm(start), norm(stop).min(len - 1));
        if start > stop || start >= len {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    /// Serializes the value and remaining TTL of `key`.
    pub fn dump(&mut self, key: &[u8]) -> Option<Bytes> {
        let entry = self.live(key)?;
        let dump = Dump {
            value: entry.value.clone(),
            ttl_ms: time::ms_until(entry.expires_at_ms),
        };
        // serializing an owned enum of byte buffers cannot fail
        bincode::serialize(&dump).ok().map(Bytes::from)
    }

    /// Recreates `key` from a payload produced by [`Keyspace::dump`],
    /// replacing any existing value.
    pub fn restore(&mut self, key: Bytes, payload: &[u8]) -> Result<(), EngineError> {
        let dump = decode_dump(payload)?;
        let expires_at_ms = dump.ttl_ms.map(time::deadline_after).unwrap_or(NO_EXPIRY);
        self.entries.insert(
            key,
            Entry {
                value: dump.value,
                expires_at_ms,
            },
        );
        Ok(())
    }

    /// Returns every live key.
    pub fn keys(&self) -> Vec<Bytes> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.is_expired())
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Checks that `payload` is a well-formed dump without storing it.
pub fn validate_dump(payload: &[u8]) -> Result<(), EngineError> {
    decode_dump(payload).map(|_| ())
}

fn decode_dump(payload: &[u8]) -> Result<Dump, EngineError> {
    bincode::deserialize(payload).map_err(|e| EngineError::BadDump(e.to_string()))
}
