//! Engine-wide settings, fixed at engine start.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Delivery attempts per NotifyRequest before the failure is recorded
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Recorded failures before a subscription transitions to `off`
    #[serde(default = "default_error_limit")]
    pub error_limit: u32,

    /// Idle interval after which a subscription is retired
    #[serde(default = "default_end_of_life_secs")]
    pub end_of_life_secs: u64,

    /// How long a `requested` subscription may wait for channel verification
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    #[serde(default = "default_dispatcher_workers")]
    pub dispatcher_workers: usize,

    /// Event generator pool size; sizes above one trade the per-subscription
    /// append-ordering guarantee for throughput
    #[serde(default = "default_generator_workers")]
    pub generator_workers: usize,

    #[serde(default = "default_ingress_queue_capacity")]
    pub ingress_queue_capacity: usize,

    #[serde(default = "default_scheduler_tick_secs")]
    pub scheduler_tick_secs: u64,

    /// Per-subscription event log retention cap
    #[serde(default = "default_event_log_retention")]
    pub event_log_retention: usize,

    /// Default per-attempt delivery timeout when the channel sets none
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u32,

    /// SMTP relay for the email channel; unset leaves email unconfigured
    #[serde(default)]
    pub smtp: Option<SmtpSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpSettings {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub from_address: String,
}

fn default_retry_limit() -> u32 {
    5
}
fn default_error_limit() -> u32 {
    5
}
fn default_end_of_life_secs() -> u64 {
    30 * 24 * 60 * 60
}
fn default_handshake_timeout_secs() -> u64 {
    300
}
fn default_dispatcher_workers() -> usize {
    16
}
fn default_generator_workers() -> usize {
    1
}
fn default_ingress_queue_capacity() -> usize {
    1024
}
fn default_scheduler_tick_secs() -> u64 {
    5
}
fn default_event_log_retention() -> usize {
    1000
}
fn default_timeout_secs() -> u32 {
    30
}
fn default_smtp_port() -> u16 {
    587
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry_limit: default_retry_limit(),
            error_limit: default_error_limit(),
            end_of_life_secs: default_end_of_life_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            dispatcher_workers: default_dispatcher_workers(),
            generator_workers: default_generator_workers(),
            ingress_queue_capacity: default_ingress_queue_capacity(),
            scheduler_tick_secs: default_scheduler_tick_secs(),
            event_log_retention: default_event_log_retention(),
            default_timeout_secs: default_timeout_secs(),
            smtp: None,
        }
    }
}

impl EngineSettings {
    pub fn end_of_life(&self) -> Duration {
        Duration::from_secs(self.end_of_life_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs.max(1))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.retry_limit == 0 {
            return Err("retry_limit must be > 0".into());
        }
        if self.error_limit == 0 {
            return Err("error_limit must be > 0".into());
        }
        if self.dispatcher_workers == 0 {
            return Err("dispatcher_workers must be > 0".into());
        }
        if self.generator_workers == 0 {
            return Err("generator_workers must be > 0".into());
        }
        if self.ingress_queue_capacity == 0 {
            return Err("ingress_queue_capacity must be > 0".into());
        }
        if self.event_log_retention == 0 {
            return Err("event_log_retention must be > 0".into());
        }
        Ok(())
    }
}
