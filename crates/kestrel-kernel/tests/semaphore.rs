mod common;

use common::{boot_at, pri, Trace};
use kestrel_kernel::{JoinHandle, Lock, Semaphore};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn ping_pong_alternates_equal_priority_threads() {
    let kernel = boot_at(31);
    let ping = Arc::new(Semaphore::new(&kernel, 0));
    let pong = Arc::new(Semaphore::new(&kernel, 0));
    let trace = Trace::default();

    let (pi, po, t) = (Arc::clone(&ping), Arc::clone(&pong), trace.clone());
    let player = kernel
        .spawn("pong", pri(31), move || {
            for round in 0..5 {
                pi.down();
                t.push(format!("pong {round}"));
                po.up();
            }
        })
        .unwrap();

    for round in 0..5 {
        trace.push(format!("ping {round}"));
        ping.up();
        pong.down();
    }
    player.join();

    let expected: Vec<String> = (0..5)
        .flat_map(|round| [format!("ping {round}"), format!("pong {round}")])
        .collect();
    assert_eq!(trace.events(), expected);
    assert_eq!(ping.value(), 0);
    assert_eq!(pong.value(), 0);
}

#[test]
fn up_wakes_the_highest_current_priority_first() {
    let kernel = boot_at(10);
    let sema = Arc::new(Semaphore::new(&kernel, 0));
    let resource = Arc::new(Lock::new(&kernel));
    let trace = Trace::default();

    let (s, r, t) = (Arc::clone(&sema), Arc::clone(&resource), trace.clone());
    let low = kernel
        .spawn("low", pri(20), move || {
            r.acquire();
            s.down();
            t.push("low");
            r.release();
        })
        .unwrap();

    let mut waiters = vec![low];
    for (name, priority) in [("mid", 30), ("high", 40)] {
        let (s, t) = (Arc::clone(&sema), trace.clone());
        waiters.push(
            kernel
                .spawn(name, pri(priority), move || {
                    s.down();
                    t.push(name);
                })
                .unwrap(),
        );
    }
    let handles: Vec<_> = waiters.iter().map(JoinHandle::handle).collect();
    assert_eq!(sema.waiters(), vec![handles[2], handles[1], handles[0]]);

    // `low` now carries a donation and outranks everyone in the queue.
    let (r, t) = (Arc::clone(&resource), trace.clone());
    let donor = kernel
        .spawn("donor", pri(50), move || {
            r.acquire();
            t.push("donor");
            r.release();
        })
        .unwrap();
    assert_eq!(kernel.thread_priority(handles[0]), pri(50));
    assert_eq!(sema.waiters(), vec![handles[2], handles[1], handles[0]]);

    for _ in 0..3 {
        sema.up();
    }
    assert_eq!(trace.events(), vec!["low", "donor", "high", "mid"]);

    donor.join();
    for waiter in waiters {
        waiter.join();
    }
}

#[test]
fn up_from_interrupt_runs_the_waiter_after_the_handler() {
    let kernel = boot_at(31);
    let sema = Arc::new(Semaphore::new(&kernel, 0));
    let trace = Trace::default();

    let (s, t) = (Arc::clone(&sema), trace.clone());
    let waiter = kernel
        .spawn("waiter", pri(50), move || {
            s.down();
            t.push("waiter woke");
        })
        .unwrap();

    let (s, t) = (Arc::clone(&sema), trace.clone());
    kernel.raise_interrupt(move || {
        s.up();
        t.push("handler done");
    });

    assert_eq!(trace.events(), vec!["handler done", "waiter woke"]);
    assert!(!kernel.in_interrupt_context());
    waiter.join();
}

#[test]
fn try_down_works_inside_a_handler() {
    let kernel = boot_at(31);
    let sema = Arc::new(Semaphore::new(&kernel, 1));
    let s = Arc::clone(&sema);
    let taken = Arc::new(AtomicUsize::new(0));
    let t = Arc::clone(&taken);
    kernel.raise_interrupt(move || {
        for _ in 0..2 {
            if s.try_down() {
                t.fetch_add(1, Ordering::SeqCst);
            }
        }
    });
    assert_eq!(taken.load(Ordering::SeqCst), 1);
    assert_eq!(sema.value(), 0);
}

#[test]
#[should_panic(expected = "not running a kernel thread")]
fn host_thread_outside_the_kernel_is_refused() {
    let kernel = boot_at(31);
    let sema = Arc::new(Semaphore::new(&kernel, 4));
    let s = Arc::clone(&sema);
    let outsider = std::thread::spawn(move || s.try_down());
    if let Err(payload) = outsider.join() {
        std::panic::resume_unwind(payload);
    }
}

#[test]
fn refused_outsiders_leave_the_semaphore_untouched() {
    let kernel = boot_at(31);
    let sema = Arc::new(Semaphore::new(&kernel, 4));
    let outsiders: Vec<_> = (0..4)
        .map(|_| {
            let s = Arc::clone(&sema);
            std::thread::spawn(move || {
                s.try_down();
                s.up();
            })
        })
        .collect();
    for outsider in outsiders {
        assert!(outsider.join().is_err());
    }
    assert_eq!(sema.value(), 4);
    assert!(sema.try_down());
}

#[test]
#[should_panic(expected = "interrupt context")]
fn down_from_interrupt_context_is_fatal() {
    let kernel = boot_at(31);
    let sema = Semaphore::new(&kernel, 0);
    kernel.raise_interrupt(|| sema.down());
}

#[test]
#[should_panic(expected = "deadlock")]
fn blocking_the_last_runnable_thread_is_a_deadlock() {
    let kernel = boot_at(31);
    let sema = Semaphore::new(&kernel, 0);
    sema.down();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn wakeups_never_exceed_ups(
        initial in 0usize..3,
        consumers in prop::collection::vec(0u8..=63, 0..6),
        ups in 0usize..8,
    ) {
        let kernel = boot_at(31);
        let sema = Arc::new(Semaphore::new(&kernel, initial));
        let done = Arc::new(AtomicUsize::new(0));

        let threads: Vec<JoinHandle> = consumers
            .iter()
            .enumerate()
            .map(|(i, &p)| {
                let (s, d) = (Arc::clone(&sema), Arc::clone(&done));
                kernel
                    .spawn(&format!("consumer{i}"), pri(p), move || {
                        s.down();
                        d.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap()
            })
            .collect();

        let total_ups = ups.max(consumers.len().saturating_sub(initial));
        for performed in 1..=total_ups {
            sema.up();
            prop_assert!(done.load(Ordering::SeqCst) <= initial + performed);
            prop_assert!(sema.waiters().len() <= consumers.len());
        }

        for thread in threads {
            thread.join();
        }
        prop_assert_eq!(done.load(Ordering::SeqCst), consumers.len());
        prop_assert_eq!(sema.value(), initial + total_ups - consumers.len());
    }
}
