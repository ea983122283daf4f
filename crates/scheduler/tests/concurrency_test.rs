//! Integration tests for concurrency caps, completion accounting and
//! failure containment on a real rayon pool.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fairshare_scheduler::{
    Completion, Dispatcher, ExecutionBackend, InlineBackend, KeyedIntake, KeyedQueue, OfferError,
    Producer, ProducerConfig, RayonBackend, SchedulerConfig, Task, TaskError, TaskId,
};

const TIMEOUT: Duration = Duration::from_secs(10);
const WORK: Duration = Duration::from_millis(5);

fn pool(threads: usize) -> Arc<RayonBackend> {
    Arc::new(RayonBackend::new("conc-test", threads).unwrap())
}

/// Poll `cond` until it holds or `TIMEOUT` elapses.
fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Tracks how many probed tasks run at once and the highest value seen.
#[derive(Default)]
struct Probe {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Probe {
    fn task(self: &Arc<Self>, owner: &str) -> Task {
        let probe = Arc::clone(self);
        Task::new(owner, move || {
            let now = probe.current.fetch_add(1, Ordering::SeqCst) + 1;
            probe.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(WORK);
            probe.current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

fn probed_supplier(
    probe: &Arc<Probe>,
    owner: &'static str,
    n: usize,
) -> impl Fn() -> Option<Task> + Send + Sync {
    let probe = Arc::clone(probe);
    let left = AtomicUsize::new(n);
    move || {
        left.fetch_update(Ordering::AcqRel, Ordering::Acquire, |l| l.checked_sub(1))
            .ok()
            .map(|_| probe.task(owner))
    }
}

#[test]
fn every_task_runs_exactly_once() {
    let d = Dispatcher::new(4, pool(4));
    let config = SchedulerConfig {
        max_threads: 4,
        ..SchedulerConfig::default()
    };
    let intake = Arc::new(KeyedIntake::from_config(&d, &config));
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let labelled = |owner: String, n: usize| {
        let seen = Arc::clone(&seen);
        let label = format!("{owner}#{n}");
        Task::new(owner, move || {
            seen.lock().unwrap().push(label);
            Ok(())
        })
    };

    // Pull-style producers.
    let producers: Vec<_> = (0..3)
        .map(|i| {
            let tasks: VecDeque<Task> = (0..40).map(|n| labelled(format!("producer-{i}"), n)).collect();
            let tasks = Mutex::new(tasks);
            Producer::new(&d, ProducerConfig::new(format!("p{i}"), 2), move || {
                tasks.lock().unwrap().pop_front()
            })
        })
        .collect();
    d.run_loop();

    // Push-style owners submitting concurrently.
    let submitters: Vec<_> = (0..4)
        .map(|i| {
            let intake = Arc::clone(&intake);
            let tasks: Vec<Task> = (0..40).map(|n| labelled(format!("owner-{i}"), n)).collect();
            std::thread::spawn(move || {
                for t in tasks {
                    intake.submit(t).unwrap();
                }
            })
        })
        .collect();
    for s in submitters {
        s.join().unwrap();
    }
    intake.close();

    assert!(intake.await_completion(TIMEOUT));
    for p in &producers {
        assert!(p.await_completion(TIMEOUT));
    }

    let seen = seen.lock().unwrap();
    let unique: HashSet<&String> = seen.iter().collect();
    assert_eq!(seen.len(), 280);
    assert_eq!(unique.len(), 280, "a task ran twice");
    assert!(wait_until(|| d.stats().completed == 280));
    assert_eq!(d.stats().submitted, 280);
}

#[test]
fn per_producer_cap_holds_under_larger_global_cap() {
    let d = Dispatcher::new(5, pool(5));
    let narrow = Arc::new(Probe::default());
    let wide = Arc::new(Probe::default());
    let p = Producer::new(&d, ProducerConfig::new("narrow", 1), probed_supplier(&narrow, "n", 20));
    let q = Producer::new(&d, ProducerConfig::new("wide", 5), probed_supplier(&wide, "w", 40));
    d.run_loop();

    assert!(p.await_completion(TIMEOUT));
    assert!(q.await_completion(TIMEOUT));
    assert_eq!(narrow.peak(), 1);
    assert!(wide.peak() <= 5);
    assert_eq!(p.completed(), 20);
    assert_eq!(q.completed(), 40);
}

#[test]
fn global_cap_bounds_all_producers() {
    let d = Dispatcher::new(3, pool(8));
    let probe = Arc::new(Probe::default());
    let producers: Vec<_> = ["a", "b", "c", "d"]
        .into_iter()
        .map(|name| Producer::new(&d, ProducerConfig::new(name, 3), probed_supplier(&probe, name, 15)))
        .collect();
    d.run_loop();

    for p in &producers {
        assert!(p.await_completion(TIMEOUT));
    }
    assert!(probe.peak() <= 3, "peak {} exceeded global cap", probe.peak());
    assert!(probe.peak() >= 1);
    assert!(wait_until(|| d.executing() == 0));
}

#[test]
fn producer_detaches_once_after_last_completion() {
    let d = Dispatcher::new(4, pool(4));
    let probe = Arc::new(Probe::default());
    let p = Producer::new(&d, ProducerConfig::new("once", 4), probed_supplier(&probe, "o", 12));
    d.run_loop();

    assert!(p.await_completion(TIMEOUT));
    assert_eq!(p.completed(), 12);
    assert_eq!(p.remaining(), 0);

    // Further wakeups find nothing and do not detach again.
    p.wake();
    d.run_loop();
    assert!(!p.detach());
    assert_eq!(d.stats().detached_producers, 1);
    assert_eq!(d.attached_count(), 0);
}

#[test]
fn full_queue_offer_times_out_after_about_a_second() {
    let queue = KeyedQueue::new(1);
    queue.offer(Task::new("a", || Ok(())), Duration::ZERO).unwrap();

    let extra = Task::new("b", || Ok(()));
    let id = extra.id();
    let started = Instant::now();
    let err = queue.offer(extra, Duration::from_secs(1)).unwrap_err();
    let waited = started.elapsed();

    assert!(matches!(err, OfferError::Timeout(_)));
    assert!(waited >= Duration::from_millis(900), "returned after {waited:?}");
    assert!(waited < Duration::from_secs(3), "returned after {waited:?}");
    assert_eq!(err.into_task().id(), id);
    assert_eq!(queue.len(), 1);
}

#[test]
fn blocked_offer_proceeds_when_space_frees() {
    let queue = Arc::new(KeyedQueue::new(1));
    queue.offer(Task::new("a", || Ok(())), Duration::ZERO).unwrap();

    let q = Arc::clone(&queue);
    let offerer = std::thread::spawn(move || q.offer(Task::new("b", || Ok(())), TIMEOUT).is_ok());
    std::thread::sleep(Duration::from_millis(50));
    assert!(queue.try_poll().is_some());
    assert!(offerer.join().unwrap());
    assert_eq!(queue.len(), 1);
}

#[test]
fn queue_loses_and_duplicates_nothing_under_contention() {
    let queue = Arc::new(KeyedQueue::new(8));
    let taken = Arc::new(Mutex::new(Vec::new()));

    let offerers: Vec<_> = (0..4)
        .map(|i| {
            let q = Arc::clone(&queue);
            std::thread::spawn(move || {
                let mut ids = Vec::new();
                for _ in 0..100 {
                    let t = Task::new(format!("owner-{i}"), || Ok(()));
                    ids.push(t.id());
                    q.offer(t, TIMEOUT).unwrap();
                }
                ids
            })
        })
        .collect();
    let pollers: Vec<_> = (0..3)
        .map(|_| {
            let q = Arc::clone(&queue);
            let taken = Arc::clone(&taken);
            std::thread::spawn(move || {
                while let Some(t) = q.poll(TIMEOUT) {
                    taken.lock().unwrap().push(t.id());
                }
            })
        })
        .collect();

    let offered: HashSet<TaskId> = offerers
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    queue.close();
    for p in pollers {
        p.join().unwrap();
    }

    let taken = taken.lock().unwrap();
    let unique: HashSet<TaskId> = taken.iter().copied().collect();
    assert_eq!(taken.len(), 400);
    assert_eq!(unique, offered);
    assert!(queue.is_empty());
}

/// Records which tasks reached the backend, then runs them inline.
#[derive(Default)]
struct RecordingBackend {
    executed: Mutex<Vec<TaskId>>,
}

impl ExecutionBackend for RecordingBackend {
    fn execute(&self, task: Task, on_complete: Completion) {
        self.executed.lock().unwrap().push(task.id());
        InlineBackend.execute(task, on_complete);
    }
}

#[test]
fn cancelled_task_never_reaches_backend() {
    let backend = Arc::new(RecordingBackend::default());
    let d = Dispatcher::new(2, backend.clone());
    let ran = Arc::new(AtomicUsize::new(0));

    let make = |ran: &Arc<AtomicUsize>| {
        let ran = Arc::clone(ran);
        Task::new("o", move || {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    };
    let doomed = make(&ran);
    let doomed_id = doomed.id();
    doomed.cancel_handle().cancel();
    let kept = make(&ran);
    let kept_id = kept.id();

    let tasks = Mutex::new(VecDeque::from(vec![doomed, kept]));
    let p = Producer::new(&d, ProducerConfig::new("p", 2), move || {
        tasks.lock().unwrap().pop_front()
    });
    d.run_loop();

    assert!(p.await_completion(TIMEOUT));
    let executed = backend.executed.lock().unwrap().clone();
    assert_eq!(executed, vec![kept_id]);
    assert!(!executed.contains(&doomed_id));
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(p.completed(), 2, "discarded task still counts as completed");
    assert_eq!(d.stats().discarded, 1);
}

#[test]
fn failures_and_panics_do_not_corrupt_accounting() {
    let d = Dispatcher::new(3, pool(3));
    let ok = Arc::new(AtomicUsize::new(0));
    let tasks: VecDeque<Task> = (0..30)
        .map(|i| match i % 3 {
            0 => Task::new("o", || Err(TaskError::Failed("boom".into()))),
            1 => Task::new("o", || panic!("task blew up")),
            _ => {
                let ok = Arc::clone(&ok);
                Task::new("o", move || {
                    ok.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }
        })
        .collect();
    let tasks = Mutex::new(tasks);
    let p = Producer::new(&d, ProducerConfig::new("mixed", 3), move || {
        tasks.lock().unwrap().pop_front()
    });
    d.run_loop();

    assert!(p.await_completion(TIMEOUT));
    assert_eq!(ok.load(Ordering::SeqCst), 10);
    assert_eq!(p.completed(), 30);
    assert_eq!(p.threads_used(), 0);
    assert!(wait_until(|| d.executing() == 0));
    assert!(wait_until(|| d.stats().completed == 30));
    assert_eq!(d.stats().failed, 0);
}
