use crate::event::{EngineEvent, EventSender};
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

struct Timer {
    token: u64,
    task: JoinHandle<()>,
}

/// One single-shot reconnect timer per node.
///
/// A timer delivers [`EngineEvent::ReconnectDue`] with the token it was armed
/// with; [`ReconnectScheduler::fire`] only accepts the token of the timer that
/// is still armed, so a cancelled or re-armed timer never triggers.
#[derive(Default)]
pub struct ReconnectScheduler {
    timers: HashMap<Uuid, Timer>,
    next_token: u64,
}

impl ReconnectScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, node: Uuid, delay: Duration, events: &EventSender) {
        self.cancel(node);
        self.next_token += 1;
        let token = self.next_token;
        let events = events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(EngineEvent::ReconnectDue { node, token });
        });
        self.timers.insert(node, Timer { token, task });
    }

    pub fn cancel(&mut self, node: Uuid) {
        if let Some(timer) = self.timers.remove(&node) {
            timer.task.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.task.abort();
        }
    }

    /// Consume a due event. Returns false for stale tokens.
    pub fn fire(&mut self, node: Uuid, token: u64) -> bool {
        match self.timers.get(&node) {
            Some(timer) if timer.token == token => {
                self.timers.remove(&node);
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self, node: Uuid) -> bool {
        self.timers.contains_key(&node)
    }
}

impl Drop for ReconnectScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
