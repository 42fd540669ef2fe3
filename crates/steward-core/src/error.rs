use std::time::Duration;

use thiserror::Error;

/// Rejected configuration. Raised before any loop starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("lease lock namespace must not be empty")]
    MissingNamespace,

    #[error("candidate identity must not be empty")]
    MissingIdentity,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("lease duration must be at least one second, got {0:?}")]
    LeaseTooShort(Duration),

    #[error("lease duration ({lease_duration:?}) must be greater than renew deadline ({renew_deadline:?})")]
    LeaseNotLongerThanRenewDeadline {
        lease_duration: Duration,
        renew_deadline: Duration,
    },

    #[error("renew deadline ({renew_deadline:?}) must be greater than retry period ({retry_period:?})")]
    RenewDeadlineNotLongerThanRetryPeriod {
        renew_deadline: Duration,
        retry_period: Duration,
    },

    #[error("unable to determine host name for the default identity")]
    Hostname,

    #[error("controller needs at least one worker")]
    ZeroWorkers,

    #[error("controller {0:?} has no reconciler")]
    MissingReconciler(String),

    #[error("controller {0:?} has no readiness probe")]
    MissingReadiness(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    #[error("cancelled while waiting for caches to sync")]
    CacheSyncAborted,

    #[error("caches did not sync within {0:?}")]
    CacheSyncTimeout(Duration),
}
