use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::types::{ChatflowError, Result};

/// Lifecycle of a single send/regenerate operation.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SendState {
    Idle,
    Streaming,
    Completed,
    Aborted,
    Failed,
}

impl SendState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Failed)
    }
}

#[derive(Debug)]
struct ControllerInner {
    state: SendState,
    token: Option<CancellationToken>,
}

/// Cooperative stop handle owned by one chat session.
///
/// Clones share state, so a UI can keep one clone for its stop button while
/// the session drives the stream. Each send gets a fresh token.
#[derive(Debug, Clone)]
pub struct CancellationController {
    inner: Arc<Mutex<ControllerInner>>,
}

impl Default for CancellationController {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationController {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ControllerInner {
                state: SendState::Idle,
                token: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControllerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Enters `streaming`. Rejected while another send is in flight.
    pub fn begin(&self) -> Result<CancellationToken> {
        let mut inner = self.lock();
        if inner.state == SendState::Streaming {
            return Err(ChatflowError::Busy.into());
        }
        let token = CancellationToken::new();
        inner.state = SendState::Streaming;
        inner.token = Some(token.clone());
        Ok(token)
    }

    /// Requests a stop. Returns true only for the call that actually cancelled.
    pub fn stop(&self) -> bool {
        let inner = self.lock();
        if inner.state != SendState::Streaming {
            return false;
        }
        match &inner.token {
            Some(token) if !token.is_cancelled() => {
                tracing::info!("[CANCEL] Stop requested for in-flight stream");
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Moves `streaming` to a terminal state. Exactly one caller gets `true`
    /// and owns finalization of the reply.
    pub fn finish(&self, terminal: SendState) -> bool {
        if !terminal.is_terminal() {
            tracing::warn!("[CANCEL] finish called with non-terminal {:?}", terminal);
            return false;
        }
        let mut inner = self.lock();
        if inner.state != SendState::Streaming {
            return false;
        }
        inner.state = terminal;
        inner.token = None;
        true
    }

    /// Releases a `begin` that never opened a stream.
    pub fn abandon(&self) {
        let mut inner = self.lock();
        if inner.state == SendState::Streaming {
            inner.state = SendState::Idle;
            inner.token = None;
        }
    }

    pub fn state(&self) -> SendState {
        self.lock().state
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == SendState::Streaming
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_rejects_concurrent_send() {
        let controller = CancellationController::new();
        let _token = controller.begin().expect("first begin");
        match controller.begin() {
            Err(e) => assert!(matches!(e.inner, ChatflowError::Busy)),
            Ok(_) => panic!("Expected Busy"),
        }
    }

    #[test]
    fn test_stop_cancels_once() {
        let controller = CancellationController::new();
        assert!(!controller.stop());

        let token = controller.begin().expect("begin");
        let ui_handle = controller.clone();
        assert!(ui_handle.stop());
        assert!(token.is_cancelled());
        assert!(!ui_handle.stop());

        assert!(controller.finish(SendState::Aborted));
        assert!(!controller.finish(SendState::Aborted));
        assert!(!ui_handle.stop());
        assert_eq!(controller.state(), SendState::Aborted);
    }

    #[test]
    fn test_fresh_token_per_send() {
        let controller = CancellationController::new();
        let first = controller.begin().expect("begin");
        controller.stop();
        controller.finish(SendState::Aborted);

        let second = controller.begin().expect("begin after terminal state");
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(controller.finish(SendState::Completed));
    }

    #[test]
    fn test_non_terminal_finish_and_abandon() {
        let controller = CancellationController::new();
        controller.begin().expect("begin");
        assert!(!controller.finish(SendState::Idle));
        controller.abandon();
        assert_eq!(controller.state(), SendState::Idle);
        assert!(controller.begin().is_ok());
    }
}
