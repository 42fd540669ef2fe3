//! JobClient port - retention controller が使う Job の取得と削除

use async_trait::async_trait;

use crate::domain::{Job, StoreError};

#[async_trait]
pub trait JobClient: Send + Sync {
    /// Read a job from the local cache. `Ok(None)` when it no longer exists.
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, StoreError>;

    /// Delete the pods labelled `job-name=<name>`, then the job itself.
    async fn delete_job_and_pods(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}
