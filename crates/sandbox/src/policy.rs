//! Continue-on-fail handling.
//!
//! Every invocation starts `Running` and settles exactly once. A failure
//! settles as `Recoverable` when the step continues on failure, in which
//! case it is replaced by an [`ErrorRecord`] in the output; otherwise it
//! settles as `Fatal` and aborts the step with a [`StepError`].

use std::fmt;

use nebula_core::NodeId;
use serde::{Deserialize, Serialize};

use crate::error::{SandboxError, StepError};
use crate::record::ErrorRecord;

/// Identity of the step a failure is reported against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepIdentity {
    /// Node id of the step in its workflow.
    pub id: NodeId,
    /// Display name.
    pub name: String,
}

impl StepIdentity {
    /// Identity for the step `id` named `name`.
    pub fn new(id: NodeId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Lifecycle of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationState {
    /// Dispatched, not settled.
    Running,
    /// Produced a valid record or records.
    Success,
    /// Failed; the step keeps going.
    Recoverable,
    /// Failed; the step aborts.
    Fatal,
}

impl InvocationState {
    /// Returns `true` once the invocation has settled.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Recoverable => "recoverable",
            Self::Fatal => "fatal",
        })
    }
}

/// Returns `true` if an invocation may move from `from` to `to`.
#[must_use]
pub fn can_transition_invocation(from: InvocationState, to: InvocationState) -> bool {
    matches!(
        (from, to),
        (InvocationState::Running, InvocationState::Success)
            | (InvocationState::Running, InvocationState::Recoverable)
            | (InvocationState::Running, InvocationState::Fatal)
    )
}

/// One invocation, tracked from dispatch until it settles.
#[derive(Debug)]
pub struct Invocation {
    item_index: Option<usize>,
    state: InvocationState,
}

impl Invocation {
    /// A running invocation for record `item_index` (`None` for all items).
    pub const fn running(item_index: Option<usize>) -> Self {
        Self {
            item_index,
            state: InvocationState::Running,
        }
    }

    /// Current state.
    pub const fn state(&self) -> InvocationState {
        self.state
    }

    /// Settles the invocation with `result` under `policy`.
    ///
    /// A success hands the value back. A failure becomes the policy's
    /// [`Continuation`]. Settling an invocation twice aborts the step with
    /// a configuration error.
    pub fn settle<T>(
        &mut self,
        policy: &ContinuationPolicy,
        step: &StepIdentity,
        result: Result<T, SandboxError>,
    ) -> Result<T, Continuation> {
        let to = policy.settle(&result);
        if !can_transition_invocation(self.state, to) {
            let error = SandboxError::configuration(format!(
                "invocation already settled as {}",
                self.state
            ));
            return Err(Continuation::Abort(StepError {
                step_id: step.id,
                step_name: step.name.clone(),
                item_index: self.item_index,
                source: error,
            }));
        }
        tracing::trace!(step = %step.name, item_index = ?self.item_index, state = %to, "invocation settled");
        self.state = to;
        result.map_err(|error| policy.decide(step, self.item_index, error))
    }
}

/// What happens after a failed invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Continuation {
    /// Emit this record in the failed invocation's place and keep going.
    Continue(ErrorRecord),
    /// Abort the step.
    Abort(StepError),
}

/// Per-step failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContinuationPolicy {
    continue_on_fail: bool,
}

impl ContinuationPolicy {
    /// Policy for a step with the given continue-on-fail setting.
    pub const fn new(continue_on_fail: bool) -> Self {
        Self { continue_on_fail }
    }

    /// Whether failures are converted into error records.
    pub const fn continue_on_fail(&self) -> bool {
        self.continue_on_fail
    }

    /// State an invocation with `result` settles in.
    pub fn settle<T>(&self, result: &Result<T, SandboxError>) -> InvocationState {
        match result {
            Ok(_) => InvocationState::Success,
            Err(error) => self.classify(error),
        }
    }

    fn classify(&self, error: &SandboxError) -> InvocationState {
        if self.continue_on_fail && error.is_recoverable() {
            InvocationState::Recoverable
        } else {
            InvocationState::Fatal
        }
    }

    /// Decides what to do about `error`.
    ///
    /// `item_index` is the failing record in "Run once for each item" and
    /// becomes the error record's lineage.
    pub fn decide(
        &self,
        step: &StepIdentity,
        item_index: Option<usize>,
        error: SandboxError,
    ) -> Continuation {
        if self.classify(&error) == InvocationState::Recoverable {
            tracing::warn!(
                step = %step.name,
                item_index = ?item_index,
                kind = %error.kind(),
                error = %error,
                "script invocation failed; continuing"
            );
            Continuation::Continue(ErrorRecord::new(error.to_string(), item_index))
        } else {
            Continuation::Abort(StepError {
                step_id: step.id,
                step_name: step.name.clone(),
                item_index,
                source: error,
            })
        }
    }
}
