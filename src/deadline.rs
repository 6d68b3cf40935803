//! Named step deadlines.
//!
//! Every participant and rule interaction the engine performs is raced
//! against a timer bound to the step's name. Each call starts its own timer,
//! so steps never share a budget across turns.

use crate::config::DeadlineConfig;
use crate::error::MatchError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Deadline-bound operation families.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Step {
    /// Participant producing a move.
    Think,
    /// Rule validating a move (also readiness checks).
    Validate,
    /// Rule accepting a move.
    Accept,
    /// Rule post-move check.
    Post,
    /// Rule initialization.
    Init,
    /// Umbrella over the whole run.
    Match,
}

/// Durations bound to step names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Deadlines {
    limits: HashMap<Step, Duration>,
}

impl Deadlines {
    /// Creates an empty set; no step is bounded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds deadlines from millisecond configuration.
    #[instrument(skip(config))]
    pub fn from_config(config: &DeadlineConfig) -> Self {
        Self::new()
            .mark(Step::Think, Duration::from_millis(*config.think()))
            .mark(Step::Validate, Duration::from_millis(*config.validate()))
            .mark(Step::Accept, Duration::from_millis(*config.accept()))
            .mark(Step::Post, Duration::from_millis(*config.post()))
            .mark(Step::Init, Duration::from_millis(*config.init()))
            .mark(Step::Match, Duration::from_millis(*config.whole_match()))
    }

    /// Binds `duration` to `step`. A zero duration removes the deadline.
    pub fn mark(mut self, step: Step, duration: Duration) -> Self {
        if duration.is_zero() {
            self.limits.remove(&step);
        } else {
            self.limits.insert(step, duration);
        }
        self
    }

    /// Returns the deadline for `step`, if one is enforced.
    pub fn limit(&self, step: Step) -> Option<Duration> {
        self.limits.get(&step).copied()
    }

    /// Runs `operation` under the deadline for `step`.
    ///
    /// When the deadline fires first the operation is dropped and its eventual
    /// result discarded. Otherwise its result passes through unchanged.
    pub async fn bound<T, F>(&self, step: Step, operation: F) -> Result<T, MatchError>
    where
        F: Future<Output = Result<T, MatchError>>,
    {
        let Some(after) = self.limit(step) else {
            return operation.await;
        };

        match tokio::time::timeout(after, operation).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%step, after_ms = after.as_millis() as u64, "Step deadline exceeded");
                Err(MatchError::timeout(step, after))
            }
        }
    }

    /// Logs the enforced deadlines.
    pub fn describe(&self) {
        for (step, limit) in &self.limits {
            debug!(%step, limit_ms = limit.as_millis() as u64, "Deadline");
        }
    }
}
