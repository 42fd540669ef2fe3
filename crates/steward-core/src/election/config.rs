//! ElectionConfig - タイミング設定、デフォルト値、起動時検証

use std::time::Duration;

use ulid::Ulid;

use crate::domain::LockKey;
use crate::error::ConfigError;

pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(2);
pub const DEFAULT_LOCK_NAME: &str = "leader-election";
pub const DEFAULT_COMPONENT: &str = "leader-election";

/// Environment fallback for the candidate identity.
pub const IDENTITY_ENV: &str = "POD_NAME";
/// Environment fallback for the lock namespace.
pub const NAMESPACE_ENV: &str = "POD_NAMESPACE";

/// Configuration of one election candidate.
///
/// # Timing
/// - `lease_duration`: how long an unrenewed lease stays valid; other
///   candidates wait this long before taking over
/// - `renew_deadline`: how long the leader keeps retrying a renewal before
///   giving up leadership on its own
/// - `retry_period`: pause between acquire/renew attempts
///
/// `lease_duration > renew_deadline > retry_period` is enforced by
/// [`validate`](Self::validate).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionConfig {
    pub identity: String,
    pub lock_name: String,
    pub lock_namespace: String,
    /// Group name, used in logs.
    pub component: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
    /// Clear the holder when the run loop is cancelled while leading, so the
    /// next candidate need not wait out the lease.
    pub release_on_cancel: bool,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            identity: String::new(),
            lock_name: DEFAULT_LOCK_NAME.to_string(),
            lock_namespace: String::new(),
            component: DEFAULT_COMPONENT.to_string(),
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            retry_period: DEFAULT_RETRY_PERIOD,
            release_on_cancel: true,
        }
    }
}

impl ElectionConfig {
    pub fn new(lock_namespace: impl Into<String>) -> Self {
        Self {
            lock_namespace: lock_namespace.into(),
            ..Self::default()
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_lock_name(mut self, lock_name: impl Into<String>) -> Self {
        self.lock_name = lock_name.into();
        self
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = component.into();
        self
    }

    pub fn with_timing(
        mut self,
        lease_duration: Duration,
        renew_deadline: Duration,
        retry_period: Duration,
    ) -> Self {
        self.lease_duration = lease_duration;
        self.renew_deadline = renew_deadline;
        self.retry_period = retry_period;
        self
    }

    pub fn with_release_on_cancel(mut self, release_on_cancel: bool) -> Self {
        self.release_on_cancel = release_on_cancel;
        self
    }

    pub fn lock_key(&self) -> LockKey {
        LockKey::new(&self.lock_namespace, &self.lock_name)
    }

    /// Lease duration as written to the record, rounded up to whole seconds
    /// so the stored lease is never shorter than configured.
    pub fn lease_duration_seconds(&self) -> u32 {
        let secs = self.lease_duration.as_secs()
            + u64::from(self.lease_duration.subsec_nanos() > 0);
        u32::try_from(secs).unwrap_or(u32::MAX)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_namespace.is_empty() {
            return Err(ConfigError::MissingNamespace);
        }
        if self.identity.is_empty() {
            return Err(ConfigError::MissingIdentity);
        }
        for (name, value) in [
            ("lease duration", self.lease_duration),
            ("renew deadline", self.renew_deadline),
            ("retry period", self.retry_period),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if self.lease_duration < Duration::from_secs(1) {
            return Err(ConfigError::LeaseTooShort(self.lease_duration));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(ConfigError::LeaseNotLongerThanRenewDeadline {
                lease_duration: self.lease_duration,
                renew_deadline: self.renew_deadline,
            });
        }
        if self.renew_deadline <= self.retry_period {
            return Err(ConfigError::RenewDeadlineNotLongerThanRetryPeriod {
                renew_deadline: self.renew_deadline,
                retry_period: self.retry_period,
            });
        }
        Ok(())
    }

    /// Fill identity and namespace from the process environment, then
    /// validate.
    pub fn resolve(self) -> Result<Self, ConfigError> {
        self.resolve_with(|name| std::env::var(name).ok())
    }

    /// Like [`resolve`](Self::resolve) with an explicit environment lookup.
    ///
    /// Identity falls back to `POD_NAME`, then to `<host name>_<ulid>` so two
    /// processes on one host never share an identity. Namespace falls back to
    /// `POD_NAMESPACE`.
    pub fn resolve_with<F>(mut self, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| env(name).filter(|value| !value.trim().is_empty());

        if self.identity.is_empty() {
            self.identity = match lookup(IDENTITY_ENV) {
                Some(identity) => identity,
                None => {
                    let host = lookup("HOSTNAME")
                        .or_else(read_hostname)
                        .ok_or(ConfigError::Hostname)?;
                    unique_identity(&host)
                }
            };
        }
        if self.lock_namespace.is_empty()
            && let Some(namespace) = lookup(NAMESPACE_ENV)
        {
            self.lock_namespace = namespace;
        }

        self.validate()?;
        Ok(self)
    }
}

fn unique_identity(host: &str) -> String {
    format!("{}_{}", host.trim(), Ulid::new())
}

fn read_hostname() -> Option<String> {
    ["/proc/sys/kernel/hostname", "/etc/hostname"]
        .iter()
        .find_map(|path| std::fs::read_to_string(path).ok())
        .map(|host| host.trim().to_string())
        .filter(|host| !host.is_empty())
}
