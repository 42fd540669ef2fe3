//! Key - work item として使う `namespace/name` 形式のキー

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Resource は change source が配信できるオブジェクト
pub trait Resource: Send + Sync {
    fn namespace(&self) -> &str;
    fn name(&self) -> &str;
}

/// ObjectKey は監視対象コレクション内のオブジェクトを識別する
///
/// `namespace/name` 形式。namespace のないオブジェクトは `name` のみ。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unexpected key format: {0:?}")]
pub struct InvalidKey(pub String);

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn for_resource<R: Resource + ?Sized>(resource: &R) -> Self {
        Self::new(resource.namespace(), resource.name())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for ObjectKey {
    type Err = InvalidKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) if !name.is_empty() => Ok(Self::new("", name)),
            (Some(namespace), Some(name), None) if !name.is_empty() => {
                Ok(Self::new(namespace, name))
            }
            _ => Err(InvalidKey(s.to_string())),
        }
    }
}
