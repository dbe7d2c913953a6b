//! Ordered timer queue
//!
//! Deadlines live in one `BTreeMap` keyed by `(deadline, TimerId)`. Ids are
//! handed out monotonically, so timers with equal deadlines pop in the order
//! they were scheduled.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::hash::Hash;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

struct Entry<G, T> {
    group: G,
    payload: T,
}

pub struct TimerQueue<G, T> {
    next_id: u64,
    queue: BTreeMap<(Instant, TimerId), Entry<G, T>>,
    /// Timer ids per group, with their deadline for removal from `queue`
    groups: HashMap<G, BTreeMap<TimerId, Instant>>,
}

impl<G, T> Default for TimerQueue<G, T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            queue: BTreeMap::new(),
            groups: HashMap::new(),
        }
    }
}

impl<G: Copy + Eq + Hash + Ord, T> TimerQueue<G, T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, group: G, deadline: Instant, payload: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.queue.insert((deadline, id), Entry { group, payload });
        self.groups.entry(group).or_default().insert(id, deadline);
        id
    }

    /// Cancel every timer whose payload matches, returning the groups that
    /// were left without pending timers
    pub fn cancel_matching(&mut self, mut matches: impl FnMut(&T) -> bool) -> BTreeSet<G> {
        let doomed: Vec<(Instant, TimerId)> = self
            .queue
            .iter()
            .filter(|(_, entry)| matches(&entry.payload))
            .map(|(at, _)| *at)
            .collect();

        let mut emptied = BTreeSet::new();
        for (deadline, id) in doomed {
            let Some(entry) = self.queue.remove(&(deadline, id)) else {
                continue;
            };
            if let Some(timers) = self.groups.get_mut(&entry.group) {
                timers.remove(&id);
            }
            self.drop_empty_group(entry.group);
            if !self.has_group(entry.group) {
                emptied.insert(entry.group);
            }
        }
        emptied
    }

    /// Cancel every timer of `group`, returning how many were pending
    pub fn cancel_group(&mut self, group: G) -> usize {
        let Some(timers) = self.groups.remove(&group) else {
            return 0;
        };
        for (id, deadline) in &timers {
            self.queue.remove(&(*deadline, *id));
        }
        timers.len()
    }

    /// Cancel everything, returning the groups that had pending timers
    pub fn cancel_all(&mut self) -> BTreeSet<G> {
        self.queue.clear();
        self.groups.drain().map(|(group, _)| group).collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Pop the earliest timer if its deadline has passed
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerId, G, T)> {
        let (&(deadline, id), _) = self.queue.iter().next()?;
        if deadline > now {
            return None;
        }
        let entry = self.queue.remove(&(deadline, id))?;
        if let Some(timers) = self.groups.get_mut(&entry.group) {
            timers.remove(&id);
        }
        self.drop_empty_group(entry.group);
        Some((id, entry.group, entry.payload))
    }

    pub fn has_group(&self, group: G) -> bool {
        self.groups.contains_key(&group)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn drop_empty_group(&mut self, group: G) {
        if self.groups.get(&group).is_some_and(|timers| timers.is_empty()) {
            self.groups.remove(&group);
        }
    }
}
