//! LeaseStore port - 共有・バージョン付きのロックレコード
//!
//! 競合する書き込みの直列化はストアに任せる。update は最後に読んだ version を
//! 伴い、間に別の書き込みがあれば [`StoreError::Conflict`] で拒否される。

use async_trait::async_trait;

use crate::domain::{LeaseRecord, LockKey, ResourceVersion, StoreError};

/// VersionedLease は読み取ったレコードとその時点の version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedLease {
    pub record: LeaseRecord,
    pub version: ResourceVersion,
}

/// LeaseStore はロックレコードへの compare-and-swap アクセスを提供
///
/// # 契約
/// - `get`: レコードがなければ `StoreError::NotFound`
/// - `create`: 既に存在すれば `StoreError::Conflict`
/// - `update`: `version` が古ければ `StoreError::Conflict`、レコードが消えていれば
///   `StoreError::NotFound`
/// - それ以外の失敗は `StoreError::Transient`
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn get(&self, key: &LockKey) -> Result<VersionedLease, StoreError>;

    async fn create(
        &self,
        key: &LockKey,
        record: &LeaseRecord,
    ) -> Result<ResourceVersion, StoreError>;

    async fn update(
        &self,
        key: &LockKey,
        record: &LeaseRecord,
        version: &ResourceVersion,
    ) -> Result<ResourceVersion, StoreError>;
}
