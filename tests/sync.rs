/*
 * Synchronization primitive scenarios on the hosted platform.
 */

mod common;

use std::sync::{Arc, Mutex};

use common::{boot, boot_default};
use ferrokern::{KernelConfig, KernelError, PolicyKind, TaskPriority};

type EventLog = Arc<Mutex<Vec<String>>>;

fn log_event(events: &EventLog, event: impl Into<String>) {
    events.lock().unwrap().push(event.into());
}

#[test]
fn mutex_waiters_wake_in_arrival_order() {
    let (kernel, _platform) = boot_default();
    let mutex = kernel.mutex_create("gate").unwrap();
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));

    // The holder takes the mutex, then three contenders arrive in a
    // known order and must be granted it in that order.
    let (k, ev) = (kernel.clone(), events.clone());
    kernel
        .task_create(
            "holder",
            move || {
                k.mutex_lock(mutex).unwrap();
                k.task_sleep(10).unwrap();
                k.mutex_unlock(mutex).unwrap();
                // Wait for the handoff chain to finish, then shut down.
                k.task_sleep(20).unwrap();
                log_event(&ev, "done");
                k.stop();
            },
            TaskPriority::Normal,
            4096,
        )
        .unwrap();

    for (name, delay) in [("first", 1u64), ("second", 2), ("third", 3)] {
        let (k, ev) = (kernel.clone(), events.clone());
        kernel
            .task_create(
                name,
                move || {
                    k.task_sleep(delay).unwrap();
                    k.mutex_lock(mutex).unwrap();
                    log_event(&ev, name);
                    k.mutex_unlock(mutex).unwrap();
                },
                TaskPriority::Normal,
                4096,
            )
            .unwrap();
    }

    kernel.start();
    assert_eq!(
        events.lock().unwrap().as_slice(),
        &["first", "second", "third", "done"]
    );
    assert_eq!(kernel.sync_stats().mutex_contentions, 3);
}

#[test]
fn recursive_mutex_releases_only_at_depth_zero() {
    let (kernel, _platform) = boot_default();
    let mutex = kernel.recursive_mutex_create("nested").unwrap();

    let k = kernel.clone();
    kernel
        .task_create(
            "nester",
            move || {
                k.mutex_lock(mutex).unwrap();
                k.mutex_lock(mutex).unwrap();
                k.mutex_lock(mutex).unwrap();

                k.mutex_unlock(mutex).unwrap();
                assert!(k.mutex_is_locked(mutex).unwrap());
                k.mutex_unlock(mutex).unwrap();
                assert!(k.mutex_is_locked(mutex).unwrap());
                k.mutex_unlock(mutex).unwrap();
                assert!(!k.mutex_is_locked(mutex).unwrap());
                k.stop();
            },
            TaskPriority::Normal,
            4096,
        )
        .unwrap();

    kernel.start();
}

#[test]
fn semaphore_post_hands_the_unit_to_the_waiter() {
    let (kernel, _platform) = boot_default();
    let sem = kernel.sem_create("units", 0).unwrap();
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));

    let (k, ev) = (kernel.clone(), events.clone());
    kernel
        .task_create(
            "consumer",
            move || {
                k.sem_wait(sem).unwrap();
                log_event(&ev, "consumed");
            },
            TaskPriority::Normal,
            4096,
        )
        .unwrap();

    let (k, ev) = (kernel.clone(), events.clone());
    kernel
        .task_create(
            "producer",
            move || {
                k.task_sleep(3).unwrap();
                log_event(&ev, "posting");
                // The first post hands its unit straight to the waiter;
                // only the second, uncontended one lands in the count.
                k.sem_post(sem).unwrap();
                k.sem_post(sem).unwrap();
                assert_eq!(k.sem_count(sem).unwrap(), 1);
                k.task_sleep(3).unwrap();
                k.stop();
            },
            TaskPriority::Normal,
            4096,
        )
        .unwrap();

    kernel.start();
    assert_eq!(events.lock().unwrap().as_slice(), &["posting", "consumed"]);
    assert_eq!(kernel.sync_stats().sem_contentions, 1);
}

#[test]
fn rwlock_writer_blocks_new_readers() {
    let (kernel, _platform) = boot_default();
    let rwlock = kernel.rwlock_create("table").unwrap();
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));

    // Reader 1 enters; a writer arrives and waits; reader 2 arrives
    // after the writer and must not pass it.
    let (k, ev) = (kernel.clone(), events.clone());
    kernel
        .task_create(
            "reader1",
            move || {
                k.rwlock_read_lock(rwlock).unwrap();
                log_event(&ev, "r1 in");
                k.task_sleep(10).unwrap();
                log_event(&ev, "r1 out");
                k.rwlock_read_unlock(rwlock).unwrap();
            },
            TaskPriority::Normal,
            4096,
        )
        .unwrap();

    let (k, ev) = (kernel.clone(), events.clone());
    kernel
        .task_create(
            "writer",
            move || {
                k.task_sleep(2).unwrap();
                log_event(&ev, "w wants");
                k.rwlock_write_lock(rwlock).unwrap();
                log_event(&ev, "w in");
                k.rwlock_write_unlock(rwlock).unwrap();
            },
            TaskPriority::Normal,
            4096,
        )
        .unwrap();

    let (k, ev) = (kernel.clone(), events.clone());
    kernel
        .task_create(
            "reader2",
            move || {
                k.task_sleep(4).unwrap();
                log_event(&ev, "r2 wants");
                k.rwlock_read_lock(rwlock).unwrap();
                log_event(&ev, "r2 in");
                k.rwlock_read_unlock(rwlock).unwrap();
                k.task_sleep(5).unwrap();
                k.stop();
            },
            TaskPriority::Normal,
            4096,
        )
        .unwrap();

    kernel.start();
    let events = events.lock().unwrap();
    let pos = |name: &str| events.iter().position(|e| e == name).unwrap();
    assert!(pos("w wants") < pos("r2 wants"));
    assert!(pos("w in") < pos("r2 in"), "reader overtook a waiting writer");
    assert!(pos("r1 out") < pos("w in"));
}

#[test]
fn priority_donation_carries_the_holder_past_middle_tasks() {
    let (kernel, platform) = boot(KernelConfig {
        policy: PolicyKind::Priority,
        priority_inheritance: true,
        ..KernelConfig::default()
    });
    let mutex = kernel.mutex_create("inverted").unwrap();
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));

    // Low takes the lock, High blocks on it, and a CPU-bound Normal
    // task stands in the middle. Without donation Normal would starve
    // Low and High would never run; with donation Low finishes first.
    let (k, plat, ev) = (kernel.clone(), platform.clone(), events.clone());
    kernel
        .task_create(
            "low",
            move || {
                k.mutex_lock(mutex).unwrap();
                log_event(&ev, "low locked");
                // Burn ticks while holding the lock. Once "high" blocks
                // on the mutex the donation keeps us ahead of "middle",
                // which wakes mid-burn and would otherwise take over.
                for _ in 0..15 {
                    plat.tick();
                }
                log_event(&ev, "low releasing");
                k.mutex_unlock(mutex).unwrap();
            },
            TaskPriority::Low,
            4096,
        )
        .unwrap();

    let (k, ev) = (kernel.clone(), events.clone());
    kernel
        .task_create(
            "high",
            move || {
                k.task_sleep(3).unwrap();
                log_event(&ev, "high wants");
                k.mutex_lock(mutex).unwrap();
                log_event(&ev, "high got");
                k.mutex_unlock(mutex).unwrap();
                k.stop();
            },
            TaskPriority::High,
            4096,
        )
        .unwrap();

    let (k, plat, ev) = (kernel.clone(), platform.clone(), events.clone());
    kernel
        .task_create(
            "middle",
            move || {
                k.task_sleep(5).unwrap();
                log_event(&ev, "middle running");
                for _ in 0..30 {
                    plat.tick();
                }
            },
            TaskPriority::Normal,
            4096,
        )
        .unwrap();

    kernel.start();
    assert_eq!(
        events.lock().unwrap().as_slice(),
        &["low locked", "high wants", "low releasing", "high got"]
    );
}

#[test]
fn usage_errors_are_reported_not_fatal() {
    let (kernel, _platform) = boot_default();
    let mutex = kernel.mutex_create("strict").unwrap();
    let sem = kernel.sem_create("held", 0).unwrap();

    let k = kernel.clone();
    kernel
        .task_create(
            "offender",
            move || {
                // Unlocking an unheld mutex is refused.
                assert_eq!(k.mutex_unlock(mutex), Err(KernelError::InvalidState));

                // Non-blocking variants surface WouldBlock.
                assert_eq!(k.sem_trywait(sem), Err(KernelError::WouldBlock));
                k.mutex_lock(mutex).unwrap();
                assert_eq!(k.mutex_trylock(mutex), Err(KernelError::WouldBlock));
                k.mutex_unlock(mutex).unwrap();
                k.stop();
            },
            TaskPriority::Normal,
            4096,
        )
        .unwrap();

    kernel.start();
}

#[test]
fn destroying_a_waited_on_primitive_fails() {
    let (kernel, _platform) = boot_default();
    let sem = kernel.sem_create("busy", 0).unwrap();
    let outcome = Arc::new(Mutex::new(None));

    let k = kernel.clone();
    kernel
        .task_create(
            "waiter",
            move || {
                let _ = k.sem_wait(sem);
            },
            TaskPriority::Normal,
            4096,
        )
        .unwrap();

    let (k, out) = (kernel.clone(), outcome.clone());
    kernel
        .task_create(
            "destroyer",
            move || {
                k.task_sleep(3).unwrap();
                *out.lock().unwrap() = Some(k.sem_destroy(sem));
                // Release the waiter so nothing dangles.
                k.sem_post(sem).unwrap();
                k.task_sleep(3).unwrap();
                k.stop();
            },
            TaskPriority::Normal,
            4096,
        )
        .unwrap();

    kernel.start();
    assert_eq!(
        *outcome.lock().unwrap(),
        Some(Err(KernelError::InvalidState))
    );
}

#[test]
fn spinlock_guards_a_short_section() {
    let (kernel, _platform) = boot_default();
    let lock = kernel.spin_create("counter").unwrap();

    let k = kernel.clone();
    kernel
        .task_create(
            "spinner",
            move || {
                k.spin_lock(lock).unwrap();
                assert_eq!(k.spin_trylock(lock), Err(KernelError::WouldBlock));
                k.spin_unlock(lock).unwrap();

                k.spin_trylock(lock).unwrap();
                k.spin_unlock(lock).unwrap();
                assert_eq!(k.spin_unlock(lock), Err(KernelError::InvalidState));
                k.stop();
            },
            TaskPriority::Normal,
            4096,
        )
        .unwrap();

    kernel.start();
}
