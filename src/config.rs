//! Stream parameters and subscription annotations (§3, §6).
//!
//! Mirrors the teacher's `SubscriptionConfig` builder pattern: a plain struct with a
//! `Default` impl for the optional knobs, plus explicit validation for anything that must be
//! positive. Nothing here ever panics — invalid configuration is always a `ConfigError`.

use std::time::Duration;

use crate::error::ConfigError;
use crate::types::Offset;

/// Immutable for the lifetime of a session (§3).
#[derive(Debug, Clone)]
pub struct StreamParameters {
    pub batch_limit_events: usize,
    pub batch_flush_timeout: Duration,
    pub stream_timeout: Duration,
    pub stream_limit_events: Option<u64>,
    pub stream_keep_alive_limit: Duration,
    pub commit_timeout: Duration,
    pub max_uncommitted_events: usize,
    pub stream_memory_limit_bytes: usize,
    /// Not named in §3's field list but required by §4.5's poll loop; kept separate from
    /// `batch_flush_timeout` since it bounds a single poll call, not a whole batch.
    pub poll_timeout: Duration,
}

impl Default for StreamParameters {
    fn default() -> Self {
        Self {
            batch_limit_events: 500,
            batch_flush_timeout: Duration::from_secs(30),
            stream_timeout: Duration::from_secs(0), // 0 == unbounded
            stream_limit_events: None,
            stream_keep_alive_limit: Duration::from_secs(30),
            commit_timeout: Duration::from_secs(60),
            max_uncommitted_events: 10_000,
            stream_memory_limit_bytes: 64 * 1024 * 1024,
            poll_timeout: Duration::from_millis(500),
        }
    }
}

impl StreamParameters {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_limit_events == 0 {
            return Err(ConfigError::MustBePositive {
                field: "batch_limit_events",
                value: 0,
            });
        }
        if self.max_uncommitted_events == 0 {
            return Err(ConfigError::MustBePositive {
                field: "max_uncommitted_events",
                value: 0,
            });
        }
        if self.stream_memory_limit_bytes == 0 {
            return Err(ConfigError::MustBePositive {
                field: "stream_memory_limit_bytes",
                value: 0,
            });
        }
        if self.commit_timeout.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "commit_timeout",
                value: 0,
            });
        }
        Ok(())
    }

    pub fn builder() -> StreamParametersBuilder {
        StreamParametersBuilder::default()
    }
}

/// Builder over [`StreamParameters`], following the teacher's "optional setters, validated at
/// `build()`" convention (§9 design note: "Builder with many optional setters").
#[derive(Debug, Default, Clone)]
pub struct StreamParametersBuilder {
    inner: PartialParams,
}

#[derive(Debug, Default, Clone)]
struct PartialParams {
    batch_limit_events: Option<usize>,
    batch_flush_timeout: Option<Duration>,
    stream_timeout: Option<Duration>,
    stream_limit_events: Option<u64>,
    stream_keep_alive_limit: Option<Duration>,
    commit_timeout: Option<Duration>,
    max_uncommitted_events: Option<usize>,
    stream_memory_limit_bytes: Option<usize>,
    poll_timeout: Option<Duration>,
}

macro_rules! setter {
    ($name:ident, $ty:ty) => {
        pub fn $name(mut self, value: $ty) -> Self {
            self.inner.$name = Some(value);
            self
        }
    };
}

impl StreamParametersBuilder {
    setter!(batch_limit_events, usize);
    setter!(batch_flush_timeout, Duration);
    setter!(stream_timeout, Duration);
    setter!(stream_keep_alive_limit, Duration);
    setter!(commit_timeout, Duration);
    setter!(max_uncommitted_events, usize);
    setter!(stream_memory_limit_bytes, usize);
    setter!(poll_timeout, Duration);

    pub fn stream_limit_events(mut self, value: u64) -> Self {
        self.inner.stream_limit_events = Some(value);
        self
    }

    pub fn build(self) -> Result<StreamParameters, ConfigError> {
        let defaults = StreamParameters::default();
        let params = StreamParameters {
            batch_limit_events: self.inner.batch_limit_events.unwrap_or(defaults.batch_limit_events),
            batch_flush_timeout: self.inner.batch_flush_timeout.unwrap_or(defaults.batch_flush_timeout),
            stream_timeout: self.inner.stream_timeout.unwrap_or(defaults.stream_timeout),
            stream_limit_events: self.inner.stream_limit_events,
            stream_keep_alive_limit: self
                .inner
                .stream_keep_alive_limit
                .unwrap_or(defaults.stream_keep_alive_limit),
            commit_timeout: self.inner.commit_timeout.unwrap_or(defaults.commit_timeout),
            max_uncommitted_events: self
                .inner
                .max_uncommitted_events
                .unwrap_or(defaults.max_uncommitted_events),
            stream_memory_limit_bytes: self
                .inner
                .stream_memory_limit_bytes
                .unwrap_or(defaults.stream_memory_limit_bytes),
            poll_timeout: self.inner.poll_timeout.unwrap_or(defaults.poll_timeout),
        };
        params.validate()?;
        Ok(params)
    }
}

/// `subscription.unprocessable.event.policy` (§6, §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnprocessableEventPolicy {
    #[default]
    SkipEvent,
    DeadLetterQueue,
    Abort,
}

/// Subscription-level annotations (§6). `max_event_send_count = None` combined with a
/// non-default policy means "policy not applied, unlimited retries" — the Open Question from
/// §9 is resolved this way and recorded in DESIGN.md.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionAnnotations {
    pub max_event_send_count: Option<u32>,
    pub unprocessable_event_policy: UnprocessableEventPolicy,
    /// Not in §6's annotation list verbatim but required to drive §4.7's autocommit: mirrors
    /// the teacher's `auto_commit_interval` subscription field. `None` disables autocommit.
    pub autocommit_interval: Option<std::time::Duration>,
    /// The configured starting offset (spec.md:79) a partition's cursor is seeded from when
    /// the coordination store has no prior commit for it. `Offset::ZERO` (the `Default`) means
    /// "from the beginning of the timeline".
    pub initial_offset: Offset,
}

/// `SKIP_MISPLACED_EVENTS` (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureToggles {
    pub skip_misplaced_events: bool,
}

impl Default for FeatureToggles {
    fn default() -> Self {
        Self {
            skip_misplaced_events: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(StreamParameters::default().validate().is_ok());
    }

    #[test]
    fn zero_batch_limit_rejected() {
        let err = StreamParameters::builder().batch_limit_events(0).build().unwrap_err();
        assert_eq!(
            err,
            ConfigError::MustBePositive {
                field: "batch_limit_events",
                value: 0
            }
        );
    }

    #[test]
    fn builder_overrides_defaults() {
        let params = StreamParameters::builder()
            .batch_limit_events(10)
            .max_uncommitted_events(5)
            .build()
            .unwrap();
        assert_eq!(params.batch_limit_events, 10);
        assert_eq!(params.max_uncommitted_events, 5);
        assert_eq!(params.commit_timeout, StreamParameters::default().commit_timeout);
    }
}
