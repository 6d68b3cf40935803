//! Match error types.

use crate::deadline::Step;
use crate::ids::PlayerId;
use derive_more::{Display, Error};
use std::time::Duration;
use tracing::instrument;

/// What went wrong while hosting a match.
///
/// Expected endings (rule-signaled completion, external abort) are not
/// errors; they are reported through [`crate::Outcome`].
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum MatchErrorKind {
    /// Unknown rule, runaway turn count, or an operation issued in the wrong phase.
    #[display("configuration: {_0}")]
    Configuration(String),
    /// A participant submitted a move the protocol does not allow.
    #[display("protocol violation by {player}: {reason}")]
    ProtocolViolation {
        /// Offending participant.
        player: PlayerId,
        /// Why the move was refused.
        reason: String,
    },
    /// A deadline-bound step did not finish in time.
    #[display("{step} step timed out after {}ms", after.as_millis())]
    Timeout {
        /// Step that overran.
        step: Step,
        /// Deadline that was exceeded.
        after: Duration,
    },
    /// A participant failed unexpectedly while producing a move.
    #[display("participant {player} failed: {message}")]
    Participant {
        /// Failing participant.
        player: PlayerId,
        /// Rendered cause.
        message: String,
    },
    /// A rule hook failed unexpectedly.
    #[display("rule hook {hook} failed: {message}")]
    Rule {
        /// Hook that failed.
        hook: &'static str,
        /// Rendered cause.
        message: String,
    },
}

/// Match error with location tracking.
#[derive(Debug, Clone, Display, Error)]
#[display("Match error: {} at {}:{}", kind, file, line)]
pub struct MatchError {
    /// What went wrong.
    pub kind: MatchErrorKind,
    /// Line number where error occurred.
    pub line: u32,
    /// Source file where error occurred.
    pub file: &'static str,
}

impl MatchError {
    /// Creates a new match error with caller location tracking.
    #[track_caller]
    #[instrument(skip(kind))]
    pub fn new(kind: MatchErrorKind) -> Self {
        let loc = std::panic::Location::caller();
        Self {
            kind,
            line: loc.line(),
            file: loc.file(),
        }
    }

    /// Configuration error.
    #[track_caller]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(MatchErrorKind::Configuration(message.into()))
    }

    /// Protocol violation attributed to `player`.
    #[track_caller]
    pub fn protocol(player: PlayerId, reason: impl Into<String>) -> Self {
        Self::new(MatchErrorKind::ProtocolViolation {
            player,
            reason: reason.into(),
        })
    }

    /// Deadline overrun for `step`.
    #[track_caller]
    pub fn timeout(step: Step, after: Duration) -> Self {
        Self::new(MatchErrorKind::Timeout { step, after })
    }

    /// Wraps a participant failure.
    ///
    /// A [`MatchError`] raised by the participant itself (for example a
    /// malformed envelope detected by a transport adapter) keeps its kind.
    #[track_caller]
    pub fn participant(player: &PlayerId, err: &anyhow::Error) -> Self {
        if let Some(inner) = err.downcast_ref::<MatchError>() {
            return inner.clone();
        }
        Self::new(MatchErrorKind::Participant {
            player: player.clone(),
            message: format!("{:#}", err),
        })
    }

    /// Wraps a rule hook failure.
    #[track_caller]
    pub fn rule(hook: &'static str, err: &anyhow::Error) -> Self {
        if let Some(inner) = err.downcast_ref::<MatchError>() {
            return inner.clone();
        }
        Self::new(MatchErrorKind::Rule {
            hook,
            message: format!("{:#}", err),
        })
    }

    /// Returns the error kind.
    pub fn kind(&self) -> &MatchErrorKind {
        &self.kind
    }

    /// True for configuration errors.
    pub fn is_configuration(&self) -> bool {
        matches!(self.kind, MatchErrorKind::Configuration(_))
    }

    /// True for refused moves and overrun deadlines, both fatal to the match.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self.kind,
            MatchErrorKind::ProtocolViolation { .. } | MatchErrorKind::Timeout { .. }
        )
    }

    /// True for deadline overruns.
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, MatchErrorKind::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_location() {
        let err = MatchError::configuration("unknown rule chess");
        let rendered = err.to_string();
        assert!(rendered.starts_with("Match error: configuration: unknown rule chess at "));
        assert!(rendered.contains("error.rs"));
    }

    #[test]
    fn test_timeout_counts_as_protocol_violation() {
        let err = MatchError::timeout(Step::Think, Duration::from_millis(100));
        assert!(err.is_timeout());
        assert!(err.is_protocol_violation());
        assert!(!err.is_configuration());
        assert_eq!(err.kind().to_string(), "think step timed out after 100ms");
    }

    #[test]
    fn test_participant_error_keeps_inner_match_error() {
        let inner = MatchError::protocol(PlayerId::new("p1"), "missing move field");
        let wrapped = anyhow::Error::new(inner.clone());
        let err = MatchError::participant(&PlayerId::new("p1"), &wrapped);
        assert_eq!(err.kind(), inner.kind());
    }

    #[test]
    fn test_participant_error_renders_cause() {
        let err = MatchError::participant(&PlayerId::new("bot"), &anyhow::anyhow!("socket closed"));
        assert_eq!(
            err.kind(),
            &MatchErrorKind::Participant {
                player: PlayerId::new("bot"),
                message: "socket closed".to_string(),
            }
        );
    }

    #[test]
    fn test_errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MatchError>();
    }
}
