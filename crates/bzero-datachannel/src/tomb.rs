//! Cooperative cancellation: a dying/dead latch with an error.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq)]
enum State {
    Alive,
    /// Cancellation requested; children are winding down.
    Dying(Option<String>),
    /// All children finished.
    Dead(Option<String>),
}

/// Shared latch every task in a session's task group watches.
///
/// `kill` moves Alive → Dying and wakes all watchers; `mark_dead` records
/// that the group has fully unwound. The first error wins; later kills
/// never overwrite it.
#[derive(Clone)]
pub struct Tomb {
    state: Arc<watch::Sender<State>>,
}

impl Tomb {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(State::Alive);
        Self { state: Arc::new(tx) }
    }

    /// Request cancellation. `error` is None for a clean shutdown.
    pub fn kill(&self, error: Option<String>) {
        self.state.send_if_modified(|state| {
            if matches!(state, State::Alive) {
                *state = State::Dying(error.clone());
                true
            } else {
                false
            }
        });
    }

    /// Record that every child task has unwound.
    pub fn mark_dead(&self) {
        self.state.send_if_modified(|state| match state.clone() {
            State::Alive => {
                *state = State::Dead(None);
                true
            }
            State::Dying(err) => {
                *state = State::Dead(err);
                true
            }
            State::Dead(_) => false,
        });
    }

    pub fn is_alive(&self) -> bool {
        matches!(*self.state.borrow(), State::Alive)
    }

    /// Resolves when cancellation has been requested (or already happened).
    pub async fn dying(&self) {
        let mut rx = self.state.subscribe();
        while matches!(*rx.borrow(), State::Alive) {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Resolves when the task group is fully dead.
    pub async fn dead(&self) {
        let mut rx = self.state.subscribe();
        while !matches!(*rx.borrow(), State::Dead(_)) {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// The terminal error, if cancellation carried one.
    pub fn err(&self) -> Option<String> {
        match &*self.state.borrow() {
            State::Alive => None,
            State::Dying(err) | State::Dead(err) => err.clone(),
        }
    }
}

impl Default for Tomb {
    fn default() -> Self {
        Self::new()
    }
}
