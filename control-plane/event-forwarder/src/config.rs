use std::time::Duration;

use envconfig::Envconfig;

use crate::delivery::BackoffPolicy;
use crate::labels::{CommonLabels, LabelsError};
use crate::leader::{LeaseConfig, default_identity};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid EVF_COMMON_LABELS: {0}")]
    CommonLabels(#[from] LabelsError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Envconfig, Clone, Debug)]
pub struct ForwarderConfig {
    #[envconfig(
        from = "EVF_LOKI_PUSH_URL",
        default = "http://loki-gateway:3100/loki/api/v1/push"
    )]
    pub loki_push_url: String,

    /// Comma-separated key=value labels attached to every record.
    #[envconfig(
        from = "EVF_COMMON_LABELS",
        default = "cluster_name=k3s-eventviewer-debug,job=eventviewer"
    )]
    pub common_labels: String,

    #[envconfig(from = "EVF_REQUEST_TIMEOUT_SECS", default = "5")]
    pub request_timeout_secs: u64,

    /// Namespace to watch; all namespaces when unset.
    #[envconfig(from = "EVF_WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Requeue delay after a transient failure.
    #[envconfig(from = "EVF_REQUEUE_SECS", default = "30")]
    pub requeue_secs: u64,

    #[envconfig(from = "HTTP_PORT", default = "8081")]
    pub http_port: u16,

    #[envconfig(nested)]
    pub backoff: BackoffConfig,

    #[envconfig(nested)]
    pub leader: LeaderElectionConfig,
}

#[derive(Envconfig, Clone, Debug)]
pub struct BackoffConfig {
    #[envconfig(from = "EVF_BACKOFF_BASE_MS", default = "200")]
    pub base_ms: u64,
    #[envconfig(from = "EVF_BACKOFF_MULTIPLIER", default = "2.0")]
    pub multiplier: f64,
    #[envconfig(from = "EVF_BACKOFF_MAX_MS", default = "5000")]
    pub max_ms: u64,
    /// Total sends per record, first attempt included.
    #[envconfig(from = "EVF_MAX_ATTEMPTS", default = "3")]
    pub max_attempts: u32,
}

#[derive(Envconfig, Clone, Debug)]
pub struct LeaderElectionConfig {
    #[envconfig(from = "EVF_LEADER_ELECT", default = "false")]
    pub enabled: bool,
    #[envconfig(from = "EVF_LEASE_NAME", default = "event-forwarder-leader")]
    pub lease_name: String,
    #[envconfig(from = "EVF_LEASE_NAMESPACE", default = "default")]
    pub lease_namespace: String,
    #[envconfig(from = "EVF_LEASE_DURATION_SECS", default = "15")]
    pub lease_duration_secs: u64,
    #[envconfig(from = "EVF_LEASE_RENEW_SECS", default = "5")]
    pub renew_secs: u64,
    #[envconfig(from = "EVF_LEASE_RELEASE_ON_CANCEL", default = "true")]
    pub release_on_cancel: bool,
}

impl ForwarderConfig {
    /// Check cross-field constraints envconfig cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.common_labels()?;
        if self.backoff.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "EVF_MAX_ATTEMPTS must be at least 1".into(),
            ));
        }
        if self.backoff.multiplier.is_nan() || self.backoff.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "EVF_BACKOFF_MULTIPLIER must be >= 1.0".into(),
            ));
        }
        if self.leader.enabled
            && self.leader.renew_secs >= self.leader.lease_duration_secs
        {
            return Err(ConfigError::Invalid(
                "EVF_LEASE_RENEW_SECS must be shorter than EVF_LEASE_DURATION_SECS"
                    .into(),
            ));
        }
        Ok(())
    }

    pub fn common_labels(&self) -> Result<CommonLabels, ConfigError> {
        Ok(CommonLabels::parse(&self.common_labels)?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn requeue_after(&self) -> Duration {
        Duration::from_secs(self.requeue_secs)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff.base_ms),
            multiplier: self.backoff.multiplier,
            max_delay: Duration::from_millis(self.backoff.max_ms),
            max_attempts: self.backoff.max_attempts,
        }
    }

    pub fn lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            name: self.leader.lease_name.clone(),
            namespace: self.leader.lease_namespace.clone(),
            identity: default_identity(),
            lease_duration: Duration::from_secs(self.leader.lease_duration_secs),
            renew_interval: Duration::from_secs(self.leader.renew_secs),
            release_on_cancel: self.leader.release_on_cancel,
        }
    }
}
