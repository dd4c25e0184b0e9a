//! Asynchronous tensor readback
//!
//! A [`ReadbackChannel`] is one output slot. Requesting, polling and taking
//! are separate calls so a caller can spread several transfers across ticks
//! without blocking on any of them.

use crate::backend::{DeviceTensor, PendingDownload};
use gazeloop_core::{Error, HostTensor, Result};
use std::fmt;
use tracing::debug;

/// Observable state of a readback slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadbackPhase {
    Idle,
    Requested,
    Ready,
    Consumed,
}

enum Slot {
    Idle,
    Requested(Box<dyn PendingDownload>),
    Ready(HostTensor),
    Consumed,
}

impl Slot {
    fn phase(&self) -> ReadbackPhase {
        match self {
            Slot::Idle => ReadbackPhase::Idle,
            Slot::Requested(_) => ReadbackPhase::Requested,
            Slot::Ready(_) => ReadbackPhase::Ready,
            Slot::Consumed => ReadbackPhase::Consumed,
        }
    }
}

pub struct ReadbackChannel {
    label: &'static str,
    slot: Slot,
    polls: u32,
}

impl fmt::Debug for ReadbackChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadbackChannel")
            .field("label", &self.label)
            .field("phase", &self.slot.phase())
            .field("polls", &self.polls)
            .finish()
    }
}

impl ReadbackChannel {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            slot: Slot::Idle,
            polls: 0,
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn phase(&self) -> ReadbackPhase {
        self.slot.phase()
    }

    /// Polls issued against the current request.
    pub fn polls(&self) -> u32 {
        self.polls
    }

    /// Start transferring `tensor` to host memory.
    ///
    /// Fails with [`Error::EmptyOutput`] when the tensor has no realized data,
    /// and with [`Error::Readback`] while a previous request on this slot is
    /// still outstanding or unread.
    pub fn request(&mut self, tensor: Box<dyn DeviceTensor>) -> Result<()> {
        match self.slot {
            Slot::Requested(_) | Slot::Ready(_) => {
                return Err(Error::Readback(format!(
                    "{}: a readback is already outstanding",
                    self.label
                )));
            }
            Slot::Idle | Slot::Consumed => {}
        }

        if !tensor.is_realized() || tensor.len() == 0 {
            self.slot = Slot::Idle;
            return Err(Error::EmptyOutput(format!(
                "{}: tensor has no realized data",
                self.label
            )));
        }

        debug!("Readback requested for {} ({} elements)", self.label, tensor.len());
        self.slot = Slot::Requested(tensor.download());
        self.polls = 0;
        Ok(())
    }

    /// Check for completion without blocking.
    pub fn poll_ready(&mut self) -> Result<bool> {
        let outcome = match &mut self.slot {
            Slot::Requested(pending) => pending.poll(),
            Slot::Ready(_) => return Ok(true),
            Slot::Idle => {
                return Err(Error::Readback(format!("{}: no readback requested", self.label)));
            }
            Slot::Consumed => {
                return Err(Error::Readback(format!("{}: readback already consumed", self.label)));
            }
        };
        self.polls = self.polls.saturating_add(1);

        match outcome {
            Ok(None) => Ok(false),
            Ok(Some(tensor)) if tensor.is_empty() => {
                self.slot = Slot::Idle;
                Err(Error::EmptyOutput(format!("{}: downloaded tensor is empty", self.label)))
            }
            Ok(Some(tensor)) => {
                debug!("Readback for {} ready after {} polls", self.label, self.polls);
                self.slot = Slot::Ready(tensor);
                Ok(true)
            }
            Err(e) => {
                self.slot = Slot::Idle;
                Err(e)
            }
        }
    }

    /// Take the host copy. Valid exactly once after [`poll_ready`](Self::poll_ready) returned `true`.
    pub fn take(&mut self) -> Result<HostTensor> {
        match std::mem::replace(&mut self.slot, Slot::Consumed) {
            Slot::Ready(tensor) => Ok(tensor),
            Slot::Consumed => Err(Error::Readback(format!(
                "{}: readback already consumed",
                self.label
            ))),
            other => {
                let phase = other.phase();
                self.slot = other;
                Err(Error::Readback(format!(
                    "{}: readback not ready ({:?})",
                    self.label, phase
                )))
            }
        }
    }

    /// Drop any pending transfer or unread data and return to `Idle`.
    pub fn reset(&mut self) {
        self.slot = Slot::Idle;
        self.polls = 0;
    }
}
