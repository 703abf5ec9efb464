//! Cancellable scheduled tasks.
//!
//! A scheduled task (a deferred flush, a delayed teardown) is represented by a
//! [`TaskToken`]. When the task finally runs it must claim its token through
//! [`TaskSlot::fire`]; if the slot was cancelled or rescheduled in the
//! meantime the claim fails and the task does nothing. The timer or queue
//! that delivers the task never has to be cancelled itself.

/// Identity of one scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskToken(u64);

/// Holds at most one live [`TaskToken`].
#[derive(Debug, Default)]
pub struct TaskSlot {
    generation: u64,
    current: Option<TaskToken>,
}

impl TaskSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule unless a task is already pending. Returns the new token, or
    /// `None` when the pending task will cover this request too.
    pub fn schedule(&mut self) -> Option<TaskToken> {
        if self.current.is_some() {
            return None;
        }
        Some(self.reschedule())
    }

    /// Schedule a new task, invalidating any pending one.
    pub fn reschedule(&mut self) -> TaskToken {
        self.generation += 1;
        let token = TaskToken(self.generation);
        self.current = Some(token);
        token
    }

    /// Invalidate the pending task. Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        self.current.take().is_some()
    }

    /// Claim `token` for execution. Succeeds only for the live token, once.
    pub fn fire(&mut self, token: TaskToken) -> bool {
        if self.current == Some(token) {
            self.current = None;
            true
        } else {
            false
        }
    }

    pub fn is_pending(&self) -> bool {
        self.current.is_some()
    }
}
