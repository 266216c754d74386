//! Threads of one process share a pid and therefore one lock holder identity. These tests
//! exercise the map under contention inside a single process; `processes.rs` covers separate
//! processes.
#![cfg(target_os = "linux")]
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use shm_hashmap::{Arena, Store, StoreOptions};

fn scratch_name() -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = format!("/shm-hashmap-concurrency-{}-{n}", std::process::id());
    let _ = Arena::remove(&name);
    name
}

fn attach(name: &str) -> Store {
    Store::create_or_attach(name, "map", &StoreOptions::default()).unwrap()
}

#[test]
fn appends_are_not_lost() {
    let name = scratch_name();
    let barrier = Arc::new(Barrier::new(4));

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let name = name.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let store = attach(&name);
                barrier.wait();
                for i in 0..50 {
                    store.append("log", format!("[{worker}:{i}]")).unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    let value = attach(&name).find("log").unwrap().unwrap();
    for worker in 0..4 {
        for i in 0..50 {
            assert!(value.contains(&format!("[{worker}:{i}]")));
        }
    }
    assert_eq!(value.matches('[').count(), 200);

    Arena::remove(&name).unwrap();
}

#[test]
fn racing_upserts_leave_one_value() {
    let name = scratch_name();
    let barrier = Arc::new(Barrier::new(2));

    let workers: Vec<_> = ["X", "Y"]
        .into_iter()
        .map(|value| {
            let name = name.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let store = attach(&name);
                barrier.wait();
                for _ in 0..200 {
                    store.insert("k", value).unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    let value = attach(&name).find("k").unwrap().unwrap();
    assert!(value == "X" || value == "Y", "{value}");

    Arena::remove(&name).unwrap();
}

#[test]
fn readers_never_see_partial_values() {
    let name = scratch_name();
    let short = "s".repeat(8);
    let long = "L".repeat(600);
    attach(&name).insert("k", &short).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let writer = {
        let (name, short, long, done) = (name.clone(), short.clone(), long.clone(), done.clone());
        thread::spawn(move || {
            let store = attach(&name);
            for i in 0..500 {
                store.insert("k", if i % 2 == 0 { &long } else { &short }).unwrap();
            }
            done.store(true, Ordering::Release);
        })
    };

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let (name, short, long, done) = (name.clone(), short.clone(), long.clone(), done.clone());
            thread::spawn(move || {
                let store = attach(&name);
                while !done.load(Ordering::Acquire) {
                    let value = store.find("k").unwrap().unwrap();
                    assert!(value == short || value == long, "torn read of {} bytes", value.len());
                    // Readers take precedence, leave the writer some room.
                    thread::sleep(Duration::from_micros(50));
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    Arena::remove(&name).unwrap();
}
