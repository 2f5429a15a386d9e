//! Priority donation bookkeeping shared by [`Lock`](super::Lock) and
//! [`Kernel::set_priority`](crate::Kernel::set_priority).
//!
//! Callers must hold interrupts masked for the whole call.

use crate::thread::ThreadManager;
use crate::types::{LockId, Priority, ThreadHandle};
use log::{trace, warn};

/// Lends `donor`'s effective priority to the holder of `lock`, then to the
/// holder of the lock that holder is blocked on, and so on.
///
/// The walk stops at the first holder already running at the donor's
/// priority or above, at a free lock, or after `max_depth` holders have been
/// raised. Returns how many holders were raised.
pub(crate) fn donate(
    manager: &mut ThreadManager,
    donor: ThreadHandle,
    lock: LockId,
    max_depth: Option<usize>,
) -> usize {
    let priority = manager.effective_priority(donor);
    let mut next = Some(lock);
    let mut depth = 0;

    while let Some(lock) = next {
        let Some(holder) = manager.lock(lock).holder else {
            break;
        };
        let Some(current) = manager.threads.get(&holder).map(|tcb| tcb.effective_priority())
        else {
            warn!("lock {lock} is still held by exited thread {holder}");
            break;
        };
        if current >= priority {
            break;
        }
        if max_depth.is_some_and(|max| depth >= max) {
            warn!(
                "donation from thread {donor} stopped after {depth} holders at lock {lock} (thread {holder})"
            );
            break;
        }

        let tcb = manager.thread_mut(holder);
        tcb.priority.effective = priority;
        tcb.priority.donated = true;
        next = tcb.blocked_on;

        let record = manager.lock_mut(lock);
        record.max_priority_of_waiting = record.max_priority_of_waiting.max(priority);

        trace!("thread {donor} donates {priority} to thread {holder} through lock {lock}");
        depth += 1;
    }

    depth
}

/// Highest effective priority among the threads currently waiting to
/// acquire `lock`.
pub(crate) fn highest_waiter(manager: &ThreadManager, lock: LockId) -> Option<Priority> {
    manager
        .threads
        .values()
        .filter(|tcb| tcb.blocked_on == Some(lock))
        .map(|tcb| tcb.effective_priority())
        .max()
}

/// Recomputes `thread`'s effective priority from its base priority and the
/// waiters of every lock it still holds. Returns the new effective priority.
pub(crate) fn refresh_priority(manager: &mut ThreadManager, thread: ThreadHandle) -> Priority {
    let held = manager.thread(thread).held_locks.clone();
    let mut effective = manager.thread(thread).priority.base;

    for lock in held {
        if let Some(waiting) = highest_waiter(manager, lock) {
            manager.lock_mut(lock).max_priority_of_waiting = waiting;
            effective = effective.max(waiting);
        }
    }

    let tcb = manager.thread_mut(thread);
    tcb.priority.effective = effective;
    tcb.priority.donated = effective > tcb.priority.base;
    effective
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerKind;

    fn priority(value: u8) -> Priority {
        Priority::new(value).unwrap()
    }

    /// Builds `holders[i]` holding lock `i` and blocked on lock `i + 1`,
    /// plus a donor blocked on lock 0.
    fn chain(
        len: usize,
        holder_priority: u8,
        donor_priority: u8,
    ) -> (ThreadManager, ThreadHandle, Vec<ThreadHandle>, Vec<LockId>) {
        let mut manager = ThreadManager::new(SchedulerKind::Priority);
        let donor = manager.boot_thread("donor", priority(donor_priority));
        let locks: Vec<LockId> = (0..len).map(|_| manager.register_lock()).collect();
        let holders: Vec<ThreadHandle> = (0..len)
            .map(|i| manager.create_thread(&format!("h{i}"), priority(holder_priority)))
            .collect();

        for (i, (&holder, &lock)) in holders.iter().zip(&locks).enumerate() {
            manager.lock_mut(lock).holder = Some(holder);
            let tcb = manager.thread_mut(holder);
            tcb.held_locks.push(lock);
            tcb.blocked_on = locks.get(i + 1).copied();
        }
        manager.thread_mut(donor).blocked_on = Some(locks[0]);
        (manager, donor, holders, locks)
    }

    #[test]
    fn donation_follows_the_whole_chain() {
        let (mut manager, donor, holders, locks) = chain(3, 10, 40);
        assert_eq!(donate(&mut manager, donor, locks[0], None), 3);
        for &holder in &holders {
            assert_eq!(manager.effective_priority(holder), priority(40));
            assert!(manager.thread(holder).priority.donated);
        }
        assert_eq!(manager.lock(locks[2]).max_priority_of_waiting, priority(40));
    }

    #[test]
    fn donation_respects_depth_bound() {
        let (mut manager, donor, holders, locks) = chain(5, 10, 40);
        assert_eq!(donate(&mut manager, donor, locks[0], Some(2)), 2);
        assert_eq!(manager.effective_priority(holders[1]), priority(40));
        assert_eq!(manager.effective_priority(holders[2]), priority(10));
        assert!(!manager.thread(holders[2]).priority.donated);
    }

    #[test]
    fn donation_stops_at_higher_holder() {
        let (mut manager, donor, holders, locks) = chain(2, 50, 40);
        assert_eq!(donate(&mut manager, donor, locks[0], None), 0);
        assert_eq!(manager.effective_priority(holders[0]), priority(50));
    }

    #[test]
    fn donation_stops_at_an_exited_holder() {
        let (mut manager, donor, holders, locks) = chain(2, 10, 40);
        manager.reap(holders[0]);
        assert_eq!(donate(&mut manager, donor, locks[0], None), 0);
        assert_eq!(manager.effective_priority(holders[1]), priority(10));
    }

    #[test]
    fn refresh_keeps_highest_remaining_donation() {
        let mut manager = ThreadManager::new(SchedulerKind::Priority);
        let holder = manager.boot_thread("holder", priority(10));
        let first = manager.register_lock();
        let second = manager.register_lock();
        for lock in [first, second] {
            manager.lock_mut(lock).holder = Some(holder);
            manager.thread_mut(holder).held_locks.push(lock);
        }
        let a = manager.create_thread("a", priority(30));
        let b = manager.create_thread("b", priority(40));
        manager.thread_mut(a).blocked_on = Some(first);
        manager.thread_mut(b).blocked_on = Some(second);

        assert_eq!(refresh_priority(&mut manager, holder), priority(40));
        assert!(manager.thread(holder).priority.donated);

        manager.thread_mut(holder).held_locks.retain(|&l| l != second);
        assert_eq!(refresh_priority(&mut manager, holder), priority(30));
        assert_eq!(manager.lock(first).max_priority_of_waiting, priority(30));

        manager.thread_mut(holder).held_locks.clear();
        assert_eq!(refresh_priority(&mut manager, holder), priority(10));
        assert!(!manager.thread(holder).priority.donated);
    }
}
