//! Lease - 候補者が奪い合う共有・バージョン付きのロックレコード

use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// LockKey は 1 つのロックレコードを識別する: `(namespace, name)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockKey {
    pub namespace: String,
    pub name: String,
}

impl LockKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// ResourceVersion はストアが払い出す CAS トークン
///
/// 呼び出し側は中身を解釈せず、最後に読んだ値をそのまま返すだけ。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// LeaseRecord はストアに置かれるロックレコード
///
/// `holder_identity` が空ならリースは空き。候補者はレコードを削除せず、
/// 解放は holder を空にすることで行う。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    pub holder_identity: String,
    pub lease_duration_seconds: u32,
    pub acquire_time: DateTime<Utc>,
    pub renew_time: DateTime<Utc>,
    pub leader_transitions: u32,
}

impl LeaseRecord {
    /// A fresh record claiming the lease for `identity` at `now`.
    pub fn claim(identity: impl Into<String>, lease_duration_seconds: u32, now: DateTime<Utc>) -> Self {
        Self {
            holder_identity: identity.into(),
            lease_duration_seconds,
            acquire_time: now,
            renew_time: now,
            leader_transitions: 0,
        }
    }

    pub fn is_held(&self) -> bool {
        !self.holder_identity.is_empty()
    }

    pub fn is_held_by(&self, identity: &str) -> bool {
        self.is_held() && self.holder_identity == identity
    }

    /// `now - renew_time > lease_duration_seconds`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let lease = ChronoDuration::seconds(i64::from(self.lease_duration_seconds));
        now.signed_duration_since(self.renew_time) > lease
    }

    /// Whether `identity` may write this record at `now`.
    pub fn can_be_taken_by(&self, identity: &str, now: DateTime<Utc>) -> bool {
        !self.is_held() || self.holder_identity == identity || self.is_expired(now)
    }

    /// The record that releases this lease: holder cleared, transitions kept.
    pub fn released(&self, now: DateTime<Utc>) -> Self {
        Self {
            holder_identity: String::new(),
            lease_duration_seconds: 1,
            acquire_time: now,
            renew_time: now,
            leader_transitions: self.leader_transitions,
        }
    }
}
