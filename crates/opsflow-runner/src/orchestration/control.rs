//! Two-tier cancellation for a workflow run.
//!
//! [`ExecutionControl::cancel`] is cooperative: running targets finish and
//! nothing new is dispatched. [`ExecutionControl::kill`] additionally
//! disposes every process handle the run currently holds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{info, warn};

use crate::pool::Recyclable;
use crate::process::ProcessHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Running,
    Cancelled,
    Killed,
}

struct ControlInner {
    state: watch::Sender<ControlState>,
    outstanding: Mutex<HashMap<u64, Arc<ProcessHandle>>>,
}

/// Cloneable cancellation handle shared between the caller and a run.
#[derive(Clone)]
pub struct ExecutionControl {
    inner: Arc<ControlInner>,
}

impl Default for ExecutionControl {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExecutionControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionControl")
            .field("state", &self.state())
            .field("outstanding", &self.outstanding().len())
            .finish()
    }
}

impl ExecutionControl {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ControlState::Running);
        Self {
            inner: Arc::new(ControlInner {
                state,
                outstanding: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn outstanding(&self) -> MutexGuard<'_, HashMap<u64, Arc<ProcessHandle>>> {
        self.inner
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ControlState {
        *self.inner.state.borrow()
    }

    /// Soft cancel. No-op once the run is already cancelled or killed.
    pub fn cancel(&self) {
        let changed = self.inner.state.send_if_modified(|state| {
            if *state == ControlState::Running {
                *state = ControlState::Cancelled;
                true
            } else {
                false
            }
        });
        if changed {
            info!("Execution cancel requested");
        }
    }

    /// Hard kill: dispose every outstanding process handle now.
    pub fn kill(&self) {
        self.inner.state.send_replace(ControlState::Killed);
        let handles: Vec<_> = self.outstanding().drain().map(|(_, h)| h).collect();
        warn!(handles = handles.len(), "Execution kill requested");
        for handle in handles {
            handle.dispose_and_forget();
        }
    }

    /// `true` after either [`cancel`](Self::cancel) or [`kill`](Self::kill).
    pub fn is_cancelled(&self) -> bool {
        self.state() != ControlState::Running
    }

    pub fn is_killed(&self) -> bool {
        self.state() == ControlState::Killed
    }

    /// Resolves once the run is killed.
    pub async fn killed(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s == ControlState::Killed).await;
    }

    /// Track `handle` until the returned guard drops.
    ///
    /// A handle tracked after the kill was issued is disposed at once.
    pub(crate) fn track(&self, handle: &Arc<ProcessHandle>) -> TrackGuard {
        self.outstanding().insert(handle.id(), Arc::clone(handle));
        if self.is_killed()
            && let Some(late) = self.outstanding().remove(&handle.id())
        {
            late.dispose_and_forget();
        }
        TrackGuard {
            control: self.clone(),
            id: handle.id(),
        }
    }
}

pub(crate) struct TrackGuard {
    control: ExecutionControl,
    id: u64,
}

impl Drop for TrackGuard {
    fn drop(&mut self) {
        self.control.outstanding().remove(&self.id);
    }
}
