//! Platform seam for intercepting asynchronous work submission

use crate::domain::HookInstallError;
use crate::stack::capture_current_thread;

/// Installs whatever interception a platform offers for work handed to other
/// threads. Without it the tracker stays inert and records nothing.
pub trait SubmissionHook: Send + Sync {
    /// # Errors
    /// Returns [`HookInstallError`] when interception cannot be set up
    fn install(&self) -> Result<(), HookInstallError>;

    fn name(&self) -> &'static str;
}

/// Interception through explicit wrapping: submitters pass their work through
/// [`AsyncOriginTracker::wrap`](super::AsyncOriginTracker::wrap) or
/// [`AsyncOriginTracker::wrap_future`](super::AsyncOriginTracker::wrap_future).
///
/// Installing only checks that the submitting thread can capture its own stack.
#[derive(Debug, Default, Clone, Copy)]
pub struct InProcessHook;

impl SubmissionHook for InProcessHook {
    fn install(&self) -> Result<(), HookInstallError> {
        if capture_current_thread(0, 8).is_empty() {
            return Err(HookInstallError::CaptureUnavailable);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in-process"
    }
}

/// For platforms with no interception at all
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedHook;

impl SubmissionHook for UnsupportedHook {
    fn install(&self) -> Result<(), HookInstallError> {
        Err(HookInstallError::Unsupported)
    }

    fn name(&self) -> &'static str {
        "unsupported"
    }
}
