use clap::ValueEnum;
use kestrel_kernel::{
    Condvar, FileSystemLock, JoinHandle, Kernel, KernelConfig, Lock, Priority, SchedulerKind,
    Semaphore, ThreadHandle,
};
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::error::Error;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

type ScenarioResult<T = ()> = Result<T, Box<dyn Error>>;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Scenario {
    /// One waiter donates to one holder
    DonateOne,
    /// A donation travels through a thread that is itself blocked
    DonateNested,
    /// One holder receives donations through two locks
    DonateMultiple,
    /// A chain longer than the donation depth bound
    DonateChain,
    /// Semaphore wake order after a waiter's priority changed
    WakeOrder,
    /// Condition variable signal order
    Condvar,
    /// System calls serialized by the file system lock
    FileLock,
}

pub fn run(scenario: Scenario, config: KernelConfig) -> ScenarioResult {
    let strict = config.scheduler == SchedulerKind::Priority;
    let stage = Stage {
        kernel: Kernel::boot(config)?,
        strict,
    };

    match scenario {
        Scenario::DonateOne => donate_one(&stage),
        Scenario::DonateNested => donate_nested(&stage),
        Scenario::DonateMultiple => donate_multiple(&stage),
        Scenario::DonateChain => donate_chain(&stage),
        Scenario::WakeOrder => wake_order(&stage),
        Scenario::Condvar => condvar(&stage),
        Scenario::FileLock => file_lock(&stage),
    }
}

fn pri(value: u8) -> Priority {
    Priority::new(value).unwrap_or(Priority::MAX)
}

/// A booted kernel plus the expectations checker. Priority expectations
/// only hold under the priority scheduler.
struct Stage {
    kernel: Arc<Kernel>,
    strict: bool,
}

impl Stage {
    fn spawn<F>(&self, name: &str, priority: u8, f: F) -> ScenarioResult<JoinHandle>
    where
        F: FnOnce(&Kernel) + Send + 'static,
    {
        let kernel = Arc::clone(&self.kernel);
        let handle = self.kernel.spawn(name, pri(priority), move || f(&kernel))?;
        // Give the new thread a chance to run under either policy.
        self.kernel.yield_now();
        Ok(handle)
    }

    fn report(&self, label: &str, thread: ThreadHandle) -> Priority {
        let actual = self.kernel.thread_priority(thread);
        let base = self.kernel.base_priority(thread);
        println!("  {label:<9} priority {actual:>2} (base {base})");
        actual
    }

    fn expect_priority(&self, label: &str, thread: ThreadHandle, expected: u8) -> ScenarioResult {
        let actual = self.report(label, thread);
        if self.strict && actual.val() != expected {
            return Err(format!("{label} runs at {actual}, expected {expected}").into());
        }
        Ok(())
    }

    fn main(&self) -> ThreadHandle {
        self.kernel.current_thread()
    }
}

fn join_all(threads: Vec<JoinHandle>) {
    for thread in threads {
        thread.join();
    }
}

fn donate_one(stage: &Stage) -> ScenarioResult {
    let kernel = &stage.kernel;
    kernel.set_priority(pri(10));
    let lock = Arc::new(Lock::new(kernel));
    lock.acquire();
    println!("main holds {} at priority {}", lock.id(), kernel.priority());

    let l = Arc::clone(&lock);
    let a = stage.spawn("a", 20, move |k| {
        println!("a: acquiring {} at priority {}", l.id(), k.priority());
        l.acquire();
        println!("a: acquired {}", l.id());
        l.release();
    })?;

    stage.expect_priority("main", stage.main(), 20)?;
    println!("main: releasing {}", lock.id());
    lock.release();
    stage.expect_priority("main", stage.main(), 10)?;
    a.join();
    Ok(())
}

fn donate_nested(stage: &Stage) -> ScenarioResult {
    let kernel = &stage.kernel;
    kernel.set_priority(pri(10));
    let first = Arc::new(Lock::new(kernel));
    let second = Arc::new(Lock::new(kernel));
    second.acquire();
    println!("main holds {} at priority {}", second.id(), kernel.priority());

    let (l1, l2) = (Arc::clone(&first), Arc::clone(&second));
    let b = stage.spawn("b", 20, move |k| {
        l1.acquire();
        println!("b: holds {}, waiting for {}", l1.id(), l2.id());
        l2.acquire();
        println!("b: acquired {} at priority {}", l2.id(), k.priority());
        l2.release();
        l1.release();
        println!("b: released both, priority {}", k.priority());
    })?;

    let l1 = Arc::clone(&first);
    let a = stage.spawn("a", 30, move |_| {
        println!("a: waiting for {}", l1.id());
        l1.acquire();
        println!("a: acquired {}", l1.id());
        l1.release();
    })?;

    stage.expect_priority("b", b.handle(), 30)?;
    stage.expect_priority("main", stage.main(), 30)?;
    second.release();
    stage.expect_priority("main", stage.main(), 10)?;
    join_all(vec![a, b]);
    Ok(())
}

fn donate_multiple(stage: &Stage) -> ScenarioResult {
    let kernel = &stage.kernel;
    kernel.set_priority(pri(10));
    let first = Arc::new(Lock::new(kernel));
    let second = Arc::new(Lock::new(kernel));
    first.acquire();
    second.acquire();
    println!("main holds {} and {}", first.id(), second.id());

    let mut threads = Vec::new();
    for (name, priority, lock) in [("a", 20, &first), ("b", 30, &second)] {
        let l = Arc::clone(lock);
        threads.push(stage.spawn(name, priority, move |_| {
            l.acquire();
            println!("{name}: acquired {}", l.id());
            l.release();
        })?);
    }

    stage.expect_priority("main", stage.main(), 30)?;
    println!("main: releasing {}", second.id());
    second.release();
    stage.expect_priority("main", stage.main(), 20)?;
    println!("main: releasing {}", first.id());
    first.release();
    stage.expect_priority("main", stage.main(), 10)?;
    join_all(threads);
    Ok(())
}

fn donate_chain(stage: &Stage) -> ScenarioResult {
    let kernel = &stage.kernel;
    let bound = kernel.config().max_donation_depth;
    let holders = bound.map_or(13, |depth| (depth + 2).min(40));
    println!("building a chain of {holders} holders, depth bound {bound:?}");

    kernel.set_priority(pri(10));
    let locks: Vec<Arc<Lock>> = (0..holders)
        .map(|_| Arc::new(Lock::new(kernel)))
        .collect();
    locks[0].acquire();

    let mut threads = Vec::new();
    for (k, pair) in locks.windows(2).enumerate() {
        let (next, own) = (Arc::clone(&pair[0]), Arc::clone(&pair[1]));
        threads.push(stage.spawn(&format!("holder{}", k + 1), 11 + k as u8, move |_| {
            own.acquire();
            next.acquire();
            next.release();
            own.release();
        })?);
    }

    let last = Arc::clone(&locks[holders - 1]);
    let donor = stage.spawn("donor", 60, move |_| {
        last.acquire();
        last.release();
    })?;

    let mut chain = vec![stage.main()];
    chain.extend(threads.iter().map(JoinHandle::handle));
    let mut raised = 0;
    for (depth, &thread) in chain.iter().rev().enumerate() {
        if stage.report(&format!("depth {}", depth + 1), thread) == pri(60) {
            raised += 1;
        }
    }

    let expected = bound.map_or(holders, |depth| depth.min(holders));
    println!("{raised} of {holders} holders received the donation");
    if stage.strict && raised != expected {
        return Err(format!("{raised} holders raised, expected {expected}").into());
    }

    locks[0].release();
    threads.push(donor);
    join_all(threads);
    Ok(())
}

fn wake_order(stage: &Stage) -> ScenarioResult {
    let kernel = &stage.kernel;
    kernel.set_priority(pri(10));
    let sema = Arc::new(Semaphore::new(kernel, 0));
    let resource = Arc::new(Lock::new(kernel));

    let mut threads = Vec::new();
    for (name, priority) in [("low", 20), ("mid", 30), ("high", 40)] {
        let (s, r) = (Arc::clone(&sema), Arc::clone(&resource));
        threads.push(stage.spawn(name, priority, move |_| {
            let holds = name == "low";
            if holds {
                r.acquire();
            }
            s.down();
            println!("{name}: woken");
            if holds {
                r.release();
            }
        })?);
    }

    let r = Arc::clone(&resource);
    threads.push(stage.spawn("donor", 50, move |_| {
        r.acquire();
        println!("donor: acquired {}", r.id());
        r.release();
    })?);
    stage.expect_priority("low", threads[0].handle(), 50)?;

    for _ in 0..3 {
        sema.up();
    }
    join_all(threads);
    Ok(())
}

fn condvar(stage: &Stage) -> ScenarioResult {
    let kernel = &stage.kernel;
    kernel.set_priority(pri(10));
    let lock = Arc::new(Lock::new(kernel));
    let cond = Arc::new(Condvar::new(kernel));

    let mut threads = Vec::new();
    for (name, priority) in [("t20", 20), ("t40", 40), ("t30", 30)] {
        let (l, c) = (Arc::clone(&lock), Arc::clone(&cond));
        threads.push(stage.spawn(name, priority, move |_| {
            l.acquire();
            c.wait(&l);
            println!("{name}: signaled");
            l.release();
        })?);
    }
    println!("{} threads waiting", cond.waiters());

    for _ in 0..threads.len() {
        let _guard = lock.lock();
        cond.signal(&lock);
    }
    join_all(threads);
    Ok(())
}

fn file_lock(stage: &Stage) -> ScenarioResult {
    let kernel = &stage.kernel;
    let files = Arc::new(FileSystemLock::new(kernel, Vec::<String>::new()));

    let mut threads = Vec::new();
    for caller in 0..4 {
        let files = Arc::clone(&files);
        threads.push(stage.spawn(&format!("caller{caller}"), 20, move |k| {
            files.with(|log| {
                println!("caller{caller}: inside the file system");
                k.yield_now();
                log.push(format!("caller{caller}"));
            });
        })?);
    }
    join_all(threads);

    let log = files.with(|log| log.clone());
    println!("file system saw {}", log.join(", "));
    if log.len() != 4 {
        return Err(format!("expected 4 file system calls, saw {}", log.len()).into());
    }
    Ok(())
}

pub struct StressReport {
    pub critical_sections: usize,
    pub contended_acquires: usize,
    pub donated_entries: usize,
    pub highest_donation: Priority,
}

#[derive(Clone, Copy)]
enum Step {
    FileSystem,
    Inner,
    Both,
}

/// State every stress worker shares.
struct Contention {
    files: FileSystemLock<usize>,
    inner: Lock,
    inside_inner: AtomicBool,
    violations: AtomicUsize,
    contended: AtomicUsize,
    donated: AtomicUsize,
    highest: AtomicU8,
}

impl Contention {
    /// Counts acquires that are about to block behind a holder a donation
    /// could raise.
    fn note_contention(&self, lock: &Lock, base: Priority) {
        if lock.holder().is_some() && base > Priority::MIN {
            self.contended.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Drops to the lowest priority while holding locks so that other
    /// workers run, pile up behind this one and donate. Restores `base`
    /// before returning.
    fn dip(&self, k: &Kernel, base: Priority) {
        k.set_priority(Priority::MIN);
        k.yield_now();
        if k.is_donated(k.current_thread()) {
            self.donated.fetch_add(1, Ordering::SeqCst);
            self.highest.fetch_max(k.priority().val(), Ordering::SeqCst);
        }
        k.set_priority(base);
    }

    fn inner_section(&self, k: &Kernel, base: Priority) {
        self.note_contention(&self.inner, base);
        self.inner.acquire();
        if self.inside_inner.swap(true, Ordering::SeqCst) {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        self.dip(k, base);
        self.inside_inner.store(false, Ordering::SeqCst);
        self.inner.release();
    }

    fn file_system_section(&self, k: &Kernel, base: Priority, nested: bool) {
        self.note_contention(self.files.lock(), base);
        self.files.with(|count| {
            let before = *count;
            self.dip(k, base);
            if nested {
                self.inner_section(k, base);
            }
            *count = before + 1;
        });
    }
}

/// Runs `threads` workers of random priority, each taking the file system
/// lock, an inner lock, or both (always in that order) `rounds` times.
///
/// Workers are all created before any of them runs, and every critical
/// section briefly drops its holder to the lowest priority, so the locks
/// are contended and holders receive donations.
pub fn stress(
    config: KernelConfig,
    threads: usize,
    rounds: usize,
    seed: u64,
) -> ScenarioResult<StressReport> {
    let strict = config.scheduler == SchedulerKind::Priority;
    let kernel = Kernel::boot(config)?;
    let mut rng = StdRng::seed_from_u64(seed);

    let shared = Arc::new(Contention {
        files: FileSystemLock::new(&kernel, 0),
        inner: Lock::new(&kernel),
        inside_inner: AtomicBool::new(false),
        violations: AtomicUsize::new(0),
        contended: AtomicUsize::new(0),
        donated: AtomicUsize::new(0),
        highest: AtomicU8::new(Priority::MIN.val()),
    });
    let mut expected_fs = 0;
    let mut sections = 0;

    // Nobody outranks main while the workers are being created.
    kernel.set_priority(Priority::MAX);

    let mut workers = Vec::with_capacity(threads);
    for id in 0..threads {
        let priority = pri(rng.gen_range(Priority::MIN.val()..=Priority::MAX.val()));
        let plan: Vec<Step> = (0..rounds)
            .map(|_| match rng.gen_range(0..3) {
                0 => Step::FileSystem,
                1 => Step::Inner,
                _ => Step::Both,
            })
            .collect();
        expected_fs += plan
            .iter()
            .filter(|step| !matches!(step, Step::Inner))
            .count();
        sections += plan.len();
        info!("worker {id} at priority {priority}");

        let shared = Arc::clone(&shared);
        let k = Arc::clone(&kernel);
        workers.push(kernel.spawn(&format!("worker{id}"), priority, move || {
            for step in plan {
                match step {
                    Step::Inner => shared.inner_section(&k, priority),
                    Step::FileSystem => shared.file_system_section(&k, priority, false),
                    Step::Both => shared.file_system_section(&k, priority, true),
                }
            }
        })?);
    }

    kernel.set_priority(Priority::MIN);
    join_all(workers);

    let fs_calls = shared.files.with(|count| *count);
    let violations = shared.violations.load(Ordering::SeqCst);
    if violations > 0 || fs_calls != expected_fs {
        return Err(format!(
            "mutual exclusion violated: {violations} overlapping sections, {fs_calls} of {expected_fs} file system updates"
        )
        .into());
    }

    let report = StressReport {
        critical_sections: sections,
        contended_acquires: shared.contended.load(Ordering::SeqCst),
        donated_entries: shared.donated.load(Ordering::SeqCst),
        highest_donation: pri(shared.highest.load(Ordering::SeqCst)),
    };
    if strict && report.contended_acquires > 0 && report.donated_entries == 0 {
        return Err(format!(
            "{} contended acquires but no holder ever ran with a donation",
            report.contended_acquires
        )
        .into());
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stress_workers_contend_and_donate() {
        let mut contended = 0;
        let mut donated = 0;
        for seed in [0, 1, 7] {
            let report = stress(KernelConfig::default(), 6, 10, seed).unwrap();
            assert_eq!(report.critical_sections, 60);
            contended += report.contended_acquires;
            donated += report.donated_entries;
        }
        assert!(contended > 0);
        assert!(donated > 0);
    }

    #[test]
    fn stress_keeps_mutual_exclusion_under_round_robin() {
        let config = KernelConfig {
            scheduler: SchedulerKind::RoundRobin,
            ..KernelConfig::default()
        };
        let report = stress(config, 4, 8, 3).unwrap();
        assert!(report.contended_acquires > 0);
    }

    #[test]
    fn every_scenario_passes() {
        for scenario in Scenario::value_variants() {
            run(*scenario, KernelConfig::default()).unwrap();
        }
    }
}
