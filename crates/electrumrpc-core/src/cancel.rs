//! Cancellation tokens with run-now-or-later callbacks.
//!
//! A callback registered on an already-cancelled token runs immediately;
//! otherwise it runs when [`CancellationToken::cancel`] is called. The flag
//! and the callback list live under one lock, so a cancel racing a
//! registration can never be missed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct TokenState {
    cancelled: bool,
    next_id: u64,
    callbacks: HashMap<u64, Callback>,
}

/// Cloneable cancellation handle. All clones share one state.
#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Arc<Mutex<TokenState>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the token and run every registered callback once.
    ///
    /// Callbacks run under the token's lock; they must not touch this token.
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        for (_, cb) in state.callbacks.drain() {
            cb();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).cancelled
    }

    /// Register `callback` to run on cancellation, or run it now if the
    /// token is already cancelled.
    ///
    /// Dropping the returned registration removes a callback that has not
    /// fired yet.
    #[must_use = "dropping the registration unregisters the callback"]
    pub fn on_cancel(&self, callback: impl FnOnce() + Send + 'static) -> CancelRegistration {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.cancelled {
            callback();
            return CancelRegistration { token: None, id: 0 };
        }
        let id = state.next_id;
        state.next_id += 1;
        state.callbacks.insert(id, Box::new(callback));
        CancelRegistration {
            token: Some(self.clone()),
            id,
        }
    }

    fn unregister(&self, id: u64) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .callbacks
            .remove(&id);
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Guard for a registered cancellation callback.
pub struct CancelRegistration {
    token: Option<CancellationToken>,
    id: u64,
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            token.unregister(self.id);
        }
    }
}
