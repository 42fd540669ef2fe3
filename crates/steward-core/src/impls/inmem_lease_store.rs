//! InMemoryLeaseStore - テスト・デモ用の CAS 付きリースストア
//!
//! レコードは JSON にシリアライズし、単調増加する version と一緒に保持する。
//! 故障注入（`fail_next`, `set_unavailable`）で不安定な呼び出しやネットワーク分断を再現する。

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::domain::{LeaseRecord, LockKey, ResourceVersion, StoreError};
use crate::ports::{LeaseStore, VersionedLease};

struct StoredLease {
    json: Vec<u8>,
    version: u64,
}

#[derive(Default)]
struct StoreState {
    records: HashMap<LockKey, StoredLease>,
    last_version: u64,
    fail_next: u32,
    unavailable: bool,
}

impl StoreState {
    fn check_available(&mut self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::transient("lease store unreachable"));
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(StoreError::transient("injected failure"));
        }
        Ok(())
    }

    fn write(&mut self, key: &LockKey, record: &LeaseRecord) -> Result<ResourceVersion, StoreError> {
        let json = serde_json::to_vec(record)
            .map_err(|e| StoreError::transient(format!("encode lease: {e}")))?;
        self.last_version += 1;
        let version = self.last_version;
        self.records.insert(key.clone(), StoredLease { json, version });
        Ok(ResourceVersion::new(version.to_string()))
    }

    fn read(&self, key: &LockKey) -> Result<VersionedLease, StoreError> {
        let stored = self.records.get(key).ok_or(StoreError::NotFound)?;
        let record = serde_json::from_slice(&stored.json)
            .map_err(|e| StoreError::transient(format!("decode lease: {e}")))?;
        Ok(VersionedLease {
            record,
            version: ResourceVersion::new(stored.version.to_string()),
        })
    }
}

#[derive(Default)]
pub struct InMemoryLeaseStore {
    state: Mutex<StoreState>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every call fail with a transient error until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Fail the next `n` calls with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.lock().fail_next = n;
    }

    /// Current record, bypassing fault injection.
    pub fn snapshot(&self, key: &LockKey) -> Option<VersionedLease> {
        self.lock().read(key).ok()
    }

    /// Overwrite a record unconditionally, as another writer would.
    pub fn force(&self, key: &LockKey, record: &LeaseRecord) -> ResourceVersion {
        // Encoding a LeaseRecord cannot fail; fall back to an empty version.
        self.lock()
            .write(key, record)
            .unwrap_or_else(|_| ResourceVersion::new(""))
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn get(&self, key: &LockKey) -> Result<VersionedLease, StoreError> {
        let mut state = self.lock();
        state.check_available()?;
        state.read(key)
    }

    async fn create(
        &self,
        key: &LockKey,
        record: &LeaseRecord,
    ) -> Result<ResourceVersion, StoreError> {
        let mut state = self.lock();
        state.check_available()?;
        if state.records.contains_key(key) {
            return Err(StoreError::Conflict);
        }
        state.write(key, record)
    }

    async fn update(
        &self,
        key: &LockKey,
        record: &LeaseRecord,
        version: &ResourceVersion,
    ) -> Result<ResourceVersion, StoreError> {
        let mut state = self.lock();
        state.check_available()?;
        let current = state.records.get(key).ok_or(StoreError::NotFound)?;
        if current.version.to_string() != version.as_str() {
            return Err(StoreError::Conflict);
        }
        state.write(key, record)
    }
}
