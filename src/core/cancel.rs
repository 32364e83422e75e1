//! Cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{WorkflowError, WorkflowResult};

/// Shared flag set by Ctrl-C and checked between workflow steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that is set when the process receives Ctrl-C.
    ///
    /// Only one handler can be installed per process; a second call fails.
    pub fn install_ctrlc() -> Result<Self, ctrlc::Error> {
        let token = Self::new();
        let flag = Arc::clone(&token.cancelled);
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::SeqCst);
        })?;
        Ok(token)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with [`WorkflowError::Cancelled`] if cancellation was requested.
    pub fn checkpoint(&self, next_step: &str) -> WorkflowResult<()> {
        if self.is_cancelled() {
            tracing::warn!(step = next_step, "cancelled");
            return Err(WorkflowError::Cancelled { step: next_step.to_string() });
        }
        Ok(())
    }
}
