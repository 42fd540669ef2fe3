//! Job: the resource the retention controller reconciles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::key::Resource;

/// A batch job as seen through the change source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub namespace: String,
    pub name: String,

    /// Set once the job has finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
}

impl Job {
    pub fn running(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            completion_time: None,
        }
    }

    pub fn completed(
        namespace: impl Into<String>,
        name: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            completion_time: Some(at),
            ..Self::running(namespace, name)
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completion_time.is_some()
    }

    /// Label selector matching the pods this job created.
    pub fn pod_selector(&self) -> String {
        format!("job-name={}", self.name)
    }
}

impl Resource for Job {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn name(&self) -> &str {
        &self.name
    }
}
