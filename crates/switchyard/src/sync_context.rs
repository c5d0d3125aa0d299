//! Thread binding.

use std::collections::VecDeque;

use parking_lot::Mutex;
use switchyard_core::{Completer, Completion};

/// Binds a call to an execution context before its handler runs.
///
/// `bind` may finish later, in which case the pipeline pauses until it does.
/// Every completed `bind` is matched by exactly one `unbind`.
pub trait ThreadBinder: Send + Sync {
    fn bind(&self) -> Completion<()>;

    fn unbind(&self);
}

struct SerialState {
    bound: bool,
    waiters: VecDeque<Completer<()>>,
}

/// Admits one bound call at a time; the rest wait in arrival order.
pub struct SerialContext {
    state: Mutex<SerialState>,
}

impl SerialContext {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SerialState {
                bound: false,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.state.lock().bound
    }

    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

impl Default for SerialContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadBinder for SerialContext {
    fn bind(&self) -> Completion<()> {
        let mut state = self.state.lock();
        if !state.bound {
            state.bound = true;
            return Completion::Ready(());
        }
        let (completer, completion) = Completion::pending();
        state.waiters.push_back(completer);
        completion
    }

    fn unbind(&self) {
        let mut state = self.state.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.complete(()) {
                return;
            }
        }
        state.bound = false;
    }
}

impl std::fmt::Debug for SerialContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SerialContext")
            .field("bound", &state.bound)
            .field("waiting", &state.waiters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_bind_waits_for_the_first_unbind() {
        let context = SerialContext::new();
        assert!(context.bind().is_ready());
        let second = context.bind();
        assert!(!second.is_ready());
        assert_eq!(context.waiting(), 1);

        context.unbind();
        assert_eq!(second.wait_blocking(), Ok(()));
        assert!(context.is_bound());
        context.unbind();
        assert!(!context.is_bound());
    }
}
