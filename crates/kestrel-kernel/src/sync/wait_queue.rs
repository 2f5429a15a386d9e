use crate::types::{Priority, ThreadHandle};
use alloc::collections::VecDeque;
use core::cmp::Ordering;

/// Ordered queue of blocked threads.
///
/// Entries are thread handles; priorities are looked up through the
/// `priority_of` callback at the moment an operation needs them, because a
/// queued thread's effective priority can change while it waits (donation).
/// Order is always descending priority with FIFO among equals.
#[derive(Debug, Default, Clone)]
pub struct WaitQueue {
    entries: VecDeque<ThreadHandle>,
}

/// Orders `a` before `b` when it has the strictly higher priority.
pub fn by_priority_desc(a: Priority, b: Priority) -> Ordering {
    b.cmp(&a)
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, thread: ThreadHandle) -> bool {
        self.entries.contains(&thread)
    }

    pub fn iter(&self) -> impl Iterator<Item = ThreadHandle> + '_ {
        self.entries.iter().copied()
    }

    pub fn front(&self) -> Option<ThreadHandle> {
        self.entries.front().copied()
    }

    pub fn push_back(&mut self, thread: ThreadHandle) {
        self.entries.push_back(thread);
    }

    pub fn pop_front(&mut self) -> Option<ThreadHandle> {
        self.entries.pop_front()
    }

    /// Inserts behind every entry whose priority is greater than or equal to
    /// the new thread's.
    pub fn insert_ordered<P>(&mut self, thread: ThreadHandle, priority_of: P)
    where
        P: Fn(ThreadHandle) -> Priority,
    {
        let priority = priority_of(thread);
        let at = self
            .entries
            .iter()
            .position(|&queued| {
                by_priority_desc(priority, priority_of(queued)) == Ordering::Less
            })
            .unwrap_or(self.entries.len());
        self.entries.insert(at, thread);
    }

    /// Stable re-sort against current priorities.
    pub fn sort_by_priority<P>(&mut self, priority_of: P)
    where
        P: Fn(ThreadHandle) -> Priority,
    {
        self.entries
            .make_contiguous()
            .sort_by(|&a, &b| by_priority_desc(priority_of(a), priority_of(b)));
    }

    /// Re-sorts, then removes the front entry.
    pub fn pop_highest<P>(&mut self, priority_of: P) -> Option<ThreadHandle>
    where
        P: Fn(ThreadHandle) -> Priority,
    {
        self.sort_by_priority(priority_of);
        self.entries.pop_front()
    }

    /// Highest current priority among the queued threads.
    pub fn highest_priority<P>(&self, priority_of: P) -> Option<Priority>
    where
        P: Fn(ThreadHandle) -> Priority,
    {
        self.entries.iter().map(|&t| priority_of(t)).max()
    }

    pub fn remove(&mut self, thread: ThreadHandle) -> bool {
        if let Some(pos) = self.entries.iter().position(|&t| t == thread) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn handle(id: u32) -> ThreadHandle {
        ThreadHandle::new(id).unwrap()
    }

    fn table(priorities: &[u8]) -> HashMap<ThreadHandle, Priority> {
        priorities
            .iter()
            .enumerate()
            .map(|(i, &p)| (handle(i as u32 + 1), Priority::new(p).unwrap()))
            .collect()
    }

    #[test]
    fn ties_keep_insertion_order() {
        let priorities = table(&[10, 20, 10, 20]);
        let lookup = |t: ThreadHandle| priorities[&t];
        let mut queue = WaitQueue::new();
        for id in 1..=4 {
            queue.insert_ordered(handle(id), lookup);
        }
        let order: Vec<u32> = queue.iter().map(|t| t.val()).collect();
        assert_eq!(order, vec![2, 4, 1, 3]);
    }

    #[test]
    fn resort_follows_changed_priorities() {
        let mut priorities = table(&[30, 20, 10]);
        let mut queue = WaitQueue::new();
        for id in 1..=3 {
            queue.insert_ordered(handle(id), |t| priorities[&t]);
        }
        assert_eq!(queue.front(), Some(handle(1)));

        // Thread 3 receives a donation after it queued.
        priorities.insert(handle(3), Priority::new(40).unwrap());
        assert_eq!(queue.front(), Some(handle(1)));
        assert_eq!(queue.pop_highest(|t| priorities[&t]), Some(handle(3)));
        assert_eq!(queue.pop_highest(|t| priorities[&t]), Some(handle(1)));
        assert_eq!(queue.pop_highest(|t| priorities[&t]), Some(handle(2)));
        assert_eq!(queue.pop_highest(|t| priorities[&t]), None);
    }

    #[test]
    fn remove_only_drops_the_named_thread() {
        let mut queue = WaitQueue::new();
        queue.push_back(handle(1));
        queue.push_back(handle(2));
        assert!(queue.remove(handle(1)));
        assert!(!queue.remove(handle(1)));
        assert!(queue.contains(handle(2)));
        assert_eq!(queue.len(), 1);
    }

    proptest! {
        #[test]
        fn ordered_insert_matches_stable_sort(priorities in prop::collection::vec(0u8..=63, 0..40)) {
            let lookup = table(&priorities);
            let mut queue = WaitQueue::new();
            for id in 1..=priorities.len() as u32 {
                queue.insert_ordered(handle(id), |t| lookup[&t]);
            }

            let mut expected: Vec<ThreadHandle> = (1..=priorities.len() as u32).map(handle).collect();
            expected.sort_by(|&a, &b| by_priority_desc(lookup[&a], lookup[&b]));

            let actual: Vec<ThreadHandle> = queue.iter().collect();
            prop_assert_eq!(actual, expected);
        }

        #[test]
        fn pop_highest_always_returns_a_maximum(
            priorities in prop::collection::vec(0u8..=63, 1..40),
            bumps in prop::collection::vec((0usize..40, 0u8..=63), 0..10),
        ) {
            let mut lookup = table(&priorities);
            let mut queue = WaitQueue::new();
            for id in 1..=priorities.len() as u32 {
                queue.push_back(handle(id));
            }
            for (index, value) in bumps {
                let id = handle((index % priorities.len()) as u32 + 1);
                lookup.insert(id, Priority::new(value).unwrap());
            }

            while let Some(best) = queue.highest_priority(|t| lookup[&t]) {
                let popped = queue.pop_highest(|t| lookup[&t]).unwrap();
                prop_assert_eq!(lookup[&popped], best);
            }
            prop_assert!(queue.is_empty());
        }
    }
}
