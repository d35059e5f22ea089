use crate::provider::RealtimeEvent;
use std::collections::{vec_deque, HashSet, VecDeque};

/// Newest-first record of everything sent and received during one session.
///
/// Ids are unique within the log: a second event carrying an id that was
/// already appended is dropped. Events without an id are always kept.
#[derive(Debug, Default, Clone)]
pub struct EventLog {
    events: VecDeque<RealtimeEvent>,
    seen: HashSet<String>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepends `event`. Returns false if it was a duplicate and dropped.
    pub fn push(&mut self, event: RealtimeEvent) -> bool {
        if let Some(id) = event.event_id.as_ref() {
            if !self.seen.insert(id.clone()) {
                return false;
            }
        }
        self.events.push_front(event);
        true
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.seen.clear();
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Newest first.
    pub fn events(&self) -> vec_deque::Iter<'_, RealtimeEvent> {
        self.events.iter()
    }

    /// View for rendering: only the newest event of each streaming delta
    /// type is kept, everything else passes through in order.
    pub fn display(&self) -> Vec<&RealtimeEvent> {
        self.display_newest(self.events.len())
    }

    /// [`display`](Self::display) restricted to the `count` newest events.
    pub fn display_newest(&self, count: usize) -> Vec<&RealtimeEvent> {
        let mut delta_kinds: HashSet<&str> = HashSet::new();
        let mut out = Vec::with_capacity(count.min(self.events.len()));
        for ev in self.events.iter().take(count) {
            if ev.is_delta() && !delta_kinds.insert(ev.kind.as_str()) {
                continue;
            }
            out.push(ev);
        }
        out
    }
}
