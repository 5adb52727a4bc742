// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Coordination store used for the out-of-band rendezvous exchange.
//!
//! The store is an append-only key-value service shared by every rank of a
//! group. The rendezvous protocol only needs three blocking operations:
//! `set`, `get` and `wait`. None of them time out.
//!
//! [`StoreExchange`] builds the two collective rounds the protocol uses on
//! top of a store: an all-gather and a barrier. Keys are namespaced as
//! `<prefix>/<sequence>/<rank>`, where the sequence advances once per round.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Serialize, de::DeserializeOwned};

use crate::{Result, SymmMemError};

/// Blocking key-value store shared by all ranks of a group.
pub trait CoordinationStore: Send + Sync + fmt::Debug {
    /// Publishes `value` under `key`.
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Reads the value stored under `key`.
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Blocks until every key in `keys` is present.
    fn wait(&self, keys: &[String]) -> Result<()>;
}

/// In-process store for ranks that live in the same process (tests, single-host tools).
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    changed: Condvar,
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if no key has been published.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Returns true if `key` has been published.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }
}

impl CoordinationStore for InMemoryStore {
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value);
        self.changed.notify_all();
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.entries
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| SymmMemError::Store(format!("key not found: {}", key)))
    }

    fn wait(&self, keys: &[String]) -> Result<()> {
        let mut entries = self.entries.lock();
        while !keys.iter().all(|key| entries.contains_key(key)) {
            self.changed.wait(&mut entries);
        }
        Ok(())
    }
}

/// Store backed by a directory visible to every rank, one file per key.
///
/// Values are written to a temporary file and renamed into place so readers
/// never observe a partial value. `wait` polls the directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    poll_interval: Duration,
}

impl FileStore {
    /// Default interval between directory polls in [`CoordinationStore::wait`].
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

    /// Opens (creating if needed) a store rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        })
    }

    /// Overrides the polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys contain '/', flatten them into a single file name.
        self.root.join(key.replace('/', "%"))
    }

    fn temp_path_for(&self, key: &str) -> PathBuf {
        let mut name = self.path_for(key).into_os_string();
        name.push(format!(".tmp.{}", std::process::id()));
        PathBuf::from(name)
    }
}

impl CoordinationStore for FileStore {
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.path_for(key);
        let tmp = self.temp_path_for(key);
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        match std::fs::read(self.path_for(key)) {
            Ok(value) => Ok(value),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SymmMemError::Store(format!("key not found: {}", key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn wait(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            let path = self.path_for(key);
            while !path.exists() {
                std::thread::sleep(self.poll_interval);
            }
        }
        Ok(())
    }
}

/// Collective rounds over a [`CoordinationStore`].
///
/// Every rank must perform the same rounds in the same order so that the
/// sequence numbers agree across the group.
#[derive(Debug)]
pub struct StoreExchange {
    prefix: String,
    seq: AtomicU64,
}

impl StoreExchange {
    /// Creates an exchange whose keys start with `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            seq: AtomicU64::new(0),
        }
    }

    /// Sequence number the next round will use.
    pub fn next_sequence(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    fn round_keys(&self, world_size: usize) -> (u64, Vec<String>) {
        let seq = self.seq.fetch_add(1, Ordering::AcqRel);
        let keys = (0..world_size)
            .map(|rank| format!("{}/{}/{}", self.prefix, seq, rank))
            .collect();
        (seq, keys)
    }

    /// Publishes `value` for `rank` and collects every rank's value in rank order.
    pub fn all_gather<T>(
        &self,
        store: &dyn CoordinationStore,
        rank: usize,
        world_size: usize,
        value: &T,
    ) -> Result<Vec<T>>
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        let (seq, keys) = self.round_keys(world_size);
        tracing::trace!(prefix = %self.prefix, seq, rank, world_size, "store all_gather");

        store.set(&keys[rank], serde_json::to_vec(value)?)?;

        let mut values = Vec::with_capacity(world_size);
        for (peer, key) in keys.iter().enumerate() {
            if peer == rank {
                values.push(value.clone());
                continue;
            }
            store.wait(std::slice::from_ref(key))?;
            values.push(serde_json::from_slice(&store.get(key)?)?);
        }
        Ok(values)
    }

    /// Blocks until every rank has reached the same round.
    pub fn barrier(
        &self,
        store: &dyn CoordinationStore,
        rank: usize,
        world_size: usize,
    ) -> Result<()> {
        self.all_gather(store, rank, world_size, &0u8).map(|_| ())
    }
}
