//! Step-limited execution of a resumable computation

use crate::backend::{Computation, DeviceTensor, StepStatus};
use gazeloop_core::{Error, Result};
use std::fmt;
use std::num::NonZeroUsize;

/// Outcome of one [`StepLimitedExecutor::advance`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Budget exhausted; call again on a later tick.
    Continuing,
    /// The computation completed; outputs may be taken.
    Finished,
}

/// Advances a computation by a bounded number of steps per call.
///
/// Progress is kept between calls. A step failure drops the computation,
/// after which every `advance` fails until a new executor is created.
pub struct StepLimitedExecutor {
    label: &'static str,
    computation: Option<Box<dyn Computation>>,
    finished: bool,
    steps: u64,
    invocations: u32,
}

impl fmt::Debug for StepLimitedExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepLimitedExecutor")
            .field("label", &self.label)
            .field("active", &self.computation.is_some())
            .field("finished", &self.finished)
            .field("steps", &self.steps)
            .field("invocations", &self.invocations)
            .finish()
    }
}

impl StepLimitedExecutor {
    pub fn new(label: &'static str, computation: Box<dyn Computation>) -> Self {
        Self {
            label,
            computation: Some(computation),
            finished: false,
            steps: 0,
            invocations: 0,
        }
    }

    pub fn advance(&mut self, budget: NonZeroUsize) -> Result<Advance> {
        if self.finished {
            return Ok(Advance::Finished);
        }

        let label = self.label;
        let computation = self.computation.as_mut().ok_or_else(|| {
            Error::ComputationFailed(format!("{}: no active computation", label))
        })?;
        self.invocations += 1;

        for _ in 0..budget.get() {
            match computation.step() {
                Ok(StepStatus::Pending) => self.steps += 1,
                Ok(StepStatus::Complete) => {
                    self.steps += 1;
                    self.finished = true;
                    return Ok(Advance::Finished);
                }
                Err(err) => {
                    let step = self.steps + 1;
                    self.computation = None;
                    let reason = match err {
                        Error::ComputationFailed(reason) => reason,
                        other => other.to_string(),
                    };
                    return Err(Error::ComputationFailed(format!(
                        "{} step {}: {}",
                        label, step, reason
                    )));
                }
            }
        }

        Ok(Advance::Continuing)
    }

    /// Move an output out of the finished computation.
    pub fn take_output(&mut self, index: usize) -> Result<Box<dyn DeviceTensor>> {
        if !self.finished {
            return Err(Error::ComputationFailed(format!(
                "{}: outputs requested before the computation finished",
                self.label
            )));
        }
        self.computation
            .as_mut()
            .ok_or_else(|| Error::ComputationFailed(format!("{}: computation released", self.label)))?
            .take_output(index)
    }

    /// Drop the computation and whatever outputs it still holds.
    pub fn release(&mut self) {
        self.computation = None;
    }

    pub fn is_active(&self) -> bool {
        self.computation.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn steps_taken(&self) -> u64 {
        self.steps
    }

    /// Number of `advance` calls that performed work.
    pub fn invocations(&self) -> u32 {
        self.invocations
    }
}
