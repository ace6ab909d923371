/**
 * Action scheduler
 * Single-slot holder for the collaborator's deferred action: the vault
 * stores the one action a successful gate pass should unlock, then takes
 * it exactly once from the success callback.
 */

use std::sync::Mutex;

pub struct ActionSlot<T> {
    pending: Mutex<Option<T>>,
}

impl<T> ActionSlot<T> {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(None),
        }
    }

    /// Record the pending action, replacing any action already stored.
    pub fn set_pending(&self, action: T) {
        *self.pending.lock().expect("action slot poisoned") = Some(action);
    }

    /// Take the pending action, leaving the slot empty. The action can
    /// therefore run at most once per `set_pending`.
    pub fn take_and_clear(&self) -> Option<T> {
        self.pending.lock().expect("action slot poisoned").take()
    }

    /// Discard the pending action without running it (user cancelled).
    pub fn clear(&self) {
        self.pending.lock().expect("action slot poisoned").take();
    }
}

impl<T> Default for ActionSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}
