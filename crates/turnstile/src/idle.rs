use crate::router::WorkerId;
use std::collections::{HashMap, VecDeque};

/// FIFO of workers with spare capacity.
///
/// Workers leave from the front in the order they joined. Removing an
/// arbitrary worker (it unregistered while idle) is O(1): its ticket is
/// forgotten and the stale queue entry is skipped on the next pop.
#[derive(Debug, Default)]
pub(crate) struct IdleQueue {
    order: VecDeque<(WorkerId, u64)>,
    members: HashMap<WorkerId, u64>,
    next_ticket: u64,
}

impl IdleQueue {
    /// Appends `id` to the back. A worker that is already idle keeps its
    /// place and `false` is returned.
    pub(crate) fn push(&mut self, id: WorkerId) -> bool {
        if self.members.contains_key(&id) {
            return false;
        }
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.members.insert(id, ticket);
        self.order.push_back((id, ticket));
        true
    }

    /// Removes and returns the worker that has been idle the longest.
    pub(crate) fn pop(&mut self) -> Option<WorkerId> {
        while let Some((id, ticket)) = self.order.pop_front() {
            if self.members.get(&id) == Some(&ticket) {
                self.members.remove(&id);
                return Some(id);
            }
        }
        None
    }

    pub(crate) fn remove(&mut self, id: WorkerId) -> bool {
        let removed = self.members.remove(&id).is_some();
        // Stale entries are normally skipped by `pop`; compact when workers
        // churn without ever being popped.
        if removed && self.order.len() > 2 * self.members.len() + 16 {
            let members = &self.members;
            self.order
                .retain(|(id, ticket)| members.get(id) == Some(ticket));
        }
        removed
    }

    pub(crate) fn contains(&self, id: WorkerId) -> bool {
        self.members.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
