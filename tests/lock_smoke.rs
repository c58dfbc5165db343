// Multi-process smoke tests: spin locks shared across fork, pools serializing on one lock.
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tandem::api::{
    ErrorKind, PoolOptions, SpawnOptions, SpinLock, WorkerPool, process_channel, spawn,
};

#[test]
fn forked_holder_blocks_parent_until_release() {
    let lock = SpinLock::new().expect("lock");
    let (mut producer, consumer) = process_channel::<bool>().expect("channel");

    let mut child = spawn(SpawnOptions::new(), || {
        producer.bind_current();
        if lock.acquire(Some(Duration::from_secs(5))).is_err() {
            return 1;
        }
        let _ = producer.resolve(true);
        std::thread::sleep(Duration::from_millis(300));
        if lock.release().is_err() {
            return 2;
        }
        0
    })
    .expect("spawn");

    assert!(consumer.wait(Some(Duration::from_secs(5))).expect("child holds lock"));
    let owner = lock.owner().expect("owner");
    assert_eq!(owner.process.0 as i32, child.pid());

    let err = lock.acquire(Some(Duration::from_millis(50))).expect_err("held by child");
    assert_eq!(err.kind(), ErrorKind::TimedOut);
    assert_eq!(err.pid(), Some(child.pid()));
    assert_eq!(lock.release().expect_err("not owner").kind(), ErrorKind::NotAcquired);

    lock.acquire(Some(Duration::from_secs(5))).expect("released by child");
    assert!(lock.is_acquired());
    lock.release().expect("release");
    assert_eq!(child.wait(Some(Duration::from_secs(5))), Some(0));
}

#[test]
fn named_lock_is_shared_by_path() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("named.lock");
    let lock = SpinLock::open(&path).expect("open");
    let (mut producer, consumer) = process_channel::<u32>().expect("channel");

    let child_path = path.clone();
    let mut child = spawn(SpawnOptions::new(), move || {
        let Ok(own) = SpinLock::open(&child_path) else {
            return 1;
        };
        if own.acquire(Some(Duration::from_secs(5))).is_err() {
            return 2;
        }
        let _ = producer.resolve(std::process::id());
        std::thread::sleep(Duration::from_millis(200));
        if own.release().is_err() {
            return 3;
        }
        0
    })
    .expect("spawn");

    let holder = consumer.wait(Some(Duration::from_secs(5))).expect("holder pid");
    assert_eq!(lock.owner().map(|owner| owner.process.0), Some(holder));
    assert_eq!(lock.acquire(Some(Duration::ZERO)).expect_err("busy").kind(), ErrorKind::TimedOut);
    lock.acquire(Some(Duration::from_secs(5))).expect("acquire after release");
    lock.release().expect("release");
    assert_eq!(child.wait(Some(Duration::from_secs(5))), Some(0));
}

fn bump(lock: &SpinLock, counter: &Path, rounds: usize) -> i32 {
    for _ in 0..rounds {
        let Ok(guard) = lock.lock(Some(Duration::from_secs(10))) else {
            return 1;
        };
        let current: u64 = fs::read_to_string(counter)
            .ok()
            .and_then(|text| text.trim().parse().ok())
            .unwrap_or(0);
        if fs::write(counter, (current + 1).to_string()).is_err() {
            return 2;
        }
        drop(guard);
    }
    0
}

#[test]
fn pool_workers_serialize_on_spin_lock() {
    let temp = tempfile::tempdir().expect("tempdir");
    let counter = temp.path().join("counter");
    fs::write(&counter, "0").expect("seed counter");
    let lock = SpinLock::new().expect("lock");

    let workers = 4;
    let rounds = 50;
    let mut pool = WorkerPool::new(
        |counter: PathBuf| bump(&lock, &counter, rounds),
        PoolOptions::new(workers).with_daemon(true),
    )
    .expect("pool");
    pool.start(counter.clone()).expect("start");
    assert!(pool.wait(Some(Duration::from_secs(30))));
    assert_eq!(pool.exit_codes(), vec![Some(0); workers]);

    let total: usize = fs::read_to_string(&counter)
        .expect("counter")
        .trim()
        .parse()
        .expect("number");
    assert_eq!(total, workers * rounds);
    assert_eq!(lock.owner(), None);
}
