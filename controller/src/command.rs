//! Command objects: stateful, awaitable firmware commands
//!
//! A [`CommandRequest`] describes what to send; the scheduler turns it into
//! frames, tracks replies, and resolves the [`CommandHandle`] with a
//! [`CommandResult`]. States move `Ready → Running` and then to exactly one
//! of `Done`, `Failed`, `TimedOut`, or `Cancelled`; replies are only
//! appended while `Running`, and a command whose timeout is zero completes
//! immediately after its frames are queued.

use std::sync::Arc;
use std::time::Duration;

use fps_comms_shared::commands::CommandId;
use fps_comms_shared::error::{FpsError, Result};
use fps_comms_shared::identifier::ResponseCode;
use fps_comms_shared::types::PositionerId;
use fps_comms_shared::wire::Reply;
use tokio::sync::{oneshot, watch};

/// Lifecycle states of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    /// Created, waiting for the scheduler to admit it
    Ready,
    /// Frames queued; collecting replies
    Running,
    /// Completed successfully
    Done,
    /// A reply refused it, or the transport failed under it
    Failed,
    /// The timeout fired before completion
    TimedOut,
    /// Cancelled by the caller or the fleet lock
    Cancelled,
}

impl CommandState {
    /// Whether the state is terminal
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Ready | Self::Running)
    }
}

/// Addressing of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// One positioner
    Unicast(PositionerId),
    /// Every positioner on every interface and bus
    Broadcast,
}

impl Target {
    /// The positioner id placed in the arbitration field
    pub const fn positioner_id(&self) -> PositionerId {
        match self {
            Self::Unicast(id) => *id,
            Self::Broadcast => PositionerId::BROADCAST,
        }
    }
}

/// Caller-tunable options for one submission
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandOptions {
    /// Overrides the registry timeout; `Some(ZERO)` is fire-and-forget
    pub timeout: Option<Duration>,
    /// Whether UNKNOWN_COMMAND counts as an acceptance; defaults to true
    /// for broadcasts and false for unicasts
    pub ignore_unknown: Option<bool>,
}

/// A command ready for submission
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Opcode to issue
    pub command: CommandId,
    /// Addressing
    pub target: Target,
    /// One payload per outbound message; empty means a single empty frame
    pub payloads: Vec<Vec<u8>>,
    /// Submission options
    pub options: CommandOptions,
}

impl CommandRequest {
    /// A single-message unicast with an empty payload
    pub fn unicast(command: CommandId, positioner: PositionerId) -> Self {
        Self {
            command,
            target: Target::Unicast(positioner),
            payloads: Vec::new(),
            options: CommandOptions::default(),
        }
    }

    /// A single-message broadcast with an empty payload
    pub fn broadcast(command: CommandId) -> Self {
        Self {
            command,
            target: Target::Broadcast,
            payloads: Vec::new(),
            options: CommandOptions::default(),
        }
    }

    /// Attach a single payload
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payloads = vec![payload];
        self
    }

    /// Attach several payloads, one outbound message each
    pub fn with_payloads(mut self, payloads: Vec<Vec<u8>>) -> Self {
        self.payloads = payloads;
        self
    }

    /// Override the registry timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Complete immediately after queueing the frames
    pub fn fire_and_forget(mut self) -> Self {
        self.options.timeout = Some(Duration::ZERO);
        self
    }

    /// Number of outbound messages this request produces
    pub fn message_count(&self) -> usize {
        self.payloads.len().max(1)
    }

    /// Effective timeout after applying the registry default
    pub fn effective_timeout(&self) -> Duration {
        self.options
            .timeout
            .unwrap_or(self.command.spec().default_timeout)
    }

    /// Effective UNKNOWN_COMMAND policy
    pub fn effective_ignore_unknown(&self) -> bool {
        self.options
            .ignore_unknown
            .unwrap_or(matches!(self.target, Target::Broadcast))
    }
}

/// Why a command failed
#[derive(Debug, Clone)]
pub enum CommandFailure {
    /// A positioner answered with a non-accepting response code
    Rejected {
        /// Who refused
        positioner: PositionerId,
        /// The code it sent
        code: ResponseCode,
    },
    /// The transport under the command failed
    Transport {
        /// Failing interface
        interface: usize,
        /// Failure description
        message: String,
    },
    /// No free uid for the `(command_id, positioner_id)` key
    ///
    /// Unreachable under the exclusion rules; kept for the taxonomy.
    UidExhausted,
}

/// Terminal record of a command
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Opcode that was issued
    pub command: CommandId,
    /// Addressing it used
    pub target: Target,
    /// Terminal state
    pub state: CommandState,
    /// Every reply received while running, in arrival order
    pub replies: Vec<Reply>,
    /// Failure detail when `state == Failed`
    pub failure: Option<CommandFailure>,
    /// The timeout that was armed
    pub timeout: Duration,
}

impl CommandResult {
    /// Count of accepting replies
    pub fn accepted_replies(&self) -> usize {
        self.replies.iter().filter(|r| r.is_accepted()).count()
    }

    /// Convert a non-`Done` terminal state into the matching error
    pub fn into_result(self) -> Result<CommandResult> {
        match self.state {
            CommandState::Done => Ok(self),
            CommandState::Failed => Err(match self.failure {
                Some(CommandFailure::Rejected { positioner, code }) => FpsError::Command {
                    command: self.command.name(),
                    positioner,
                    code,
                },
                Some(CommandFailure::Transport { interface, message }) => {
                    FpsError::Transport { interface, message }
                }
                Some(CommandFailure::UidExhausted) => FpsError::UidPoolExhausted {
                    command: self.command.name(),
                    positioner: self.target.positioner_id(),
                },
                None => FpsError::Command {
                    command: self.command.name(),
                    positioner: self.target.positioner_id(),
                    code: ResponseCode::InvalidValue,
                },
            }),
            CommandState::TimedOut => Err(FpsError::Timeout {
                command: self.command.name(),
                positioner: self.target.positioner_id(),
                timeout: self.timeout,
            }),
            CommandState::Cancelled => Err(FpsError::Cancelled),
            CommandState::Ready | CommandState::Running => Err(FpsError::Cancelled),
        }
    }
}

/// Awaitable, cancellable handle to a submitted command
#[derive(Debug)]
pub struct CommandHandle {
    /// Opcode this handle tracks
    pub command: CommandId,
    pub(crate) state: watch::Receiver<CommandState>,
    pub(crate) result: oneshot::Receiver<CommandResult>,
    pub(crate) cancel: Arc<watch::Sender<bool>>,
}

impl CommandHandle {
    /// Current state
    pub fn state(&self) -> CommandState {
        *self.state.borrow()
    }

    /// Request cancellation
    ///
    /// The command transitions to `Cancelled`, returns its uids, and, when
    /// its opcode has an abort form, the abort is issued on the same
    /// positioner. Replies arriving after cancellation are dropped.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Wait for the terminal result, whatever it is
    pub async fn outcome(self) -> CommandResult {
        let command = self.command;
        let timeout = command.spec().default_timeout;
        self.result.await.unwrap_or(CommandResult {
            command,
            target: Target::Broadcast,
            state: CommandState::Cancelled,
            replies: Vec::new(),
            failure: None,
            timeout,
        })
    }

    /// Wait and convert failures into errors
    pub async fn wait(self) -> Result<CommandResult> {
        self.outcome().await.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!CommandState::Ready.is_terminal());
        assert!(!CommandState::Running.is_terminal());
        assert!(CommandState::Done.is_terminal());
        assert!(CommandState::Failed.is_terminal());
        assert!(CommandState::TimedOut.is_terminal());
        assert!(CommandState::Cancelled.is_terminal());
    }

    #[test]
    fn test_effective_defaults() {
        let unicast = CommandRequest::unicast(CommandId::GetStatus, PositionerId::new(4));
        assert_eq!(unicast.effective_timeout(), Duration::from_millis(500));
        assert!(!unicast.effective_ignore_unknown());
        assert_eq!(unicast.message_count(), 1);

        let broadcast = CommandRequest::broadcast(CommandId::GetStatus);
        assert!(broadcast.effective_ignore_unknown());

        let fire = CommandRequest::broadcast(CommandId::SendTrajectoryAbort).fire_and_forget();
        assert_eq!(fire.effective_timeout(), Duration::ZERO);
    }

    #[test]
    fn test_into_result_maps_states() {
        let base = CommandResult {
            command: CommandId::GetStatus,
            target: Target::Unicast(PositionerId::new(4)),
            state: CommandState::Done,
            replies: Vec::new(),
            failure: None,
            timeout: Duration::from_secs(1),
        };

        assert!(base.clone().into_result().is_ok());

        let timed_out = CommandResult {
            state: CommandState::TimedOut,
            ..base.clone()
        };
        assert!(matches!(
            timed_out.into_result(),
            Err(FpsError::Timeout { .. })
        ));

        let failed = CommandResult {
            state: CommandState::Failed,
            failure: Some(CommandFailure::Rejected {
                positioner: PositionerId::new(4),
                code: ResponseCode::InvalidValue,
            }),
            ..base
        };
        assert!(matches!(failed.into_result(), Err(FpsError::Command { .. })));
    }
}
