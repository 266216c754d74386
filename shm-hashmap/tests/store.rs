#![cfg(target_os = "linux")]
use std::sync::atomic::{AtomicU32, Ordering};

use shm_hashmap::{Arena, ArenaOptions, Error, KeyFold, MapOptions, Store, StoreOptions, Upsert};

/// An arena name unique to this test run, removed again on drop.
struct Scratch(String);

impl Scratch {
    fn new() -> Self {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let name = format!("/shm-hashmap-store-{}-{n}", std::process::id());
        let _ = Arena::remove(&name);
        Scratch(name)
    }

    fn store(&self, options: &StoreOptions) -> Store {
        Store::create_or_attach(&self.0, "map", options).unwrap()
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = Arena::remove(&self.0);
    }
}

#[test]
fn create_update_read() {
    let scratch = Scratch::new();
    let store = scratch.store(&StoreOptions::default());

    for key in 0..10 {
        assert_eq!(store.insert(key, "create").unwrap(), Upsert::Inserted);
    }
    assert_eq!(store.size().unwrap(), 10);

    // A second process would attach the same way.
    let other = scratch.store(&StoreOptions::default());
    for key in 0..10 {
        assert_eq!(other.find(key).unwrap().as_deref(), Some("create"));
        assert_eq!(other.insert(key, "run-2").unwrap(), Upsert::Replaced);
    }

    for key in 0..10 {
        assert_eq!(store.find(key).unwrap().as_deref(), Some("run-2"));
    }
    assert_eq!(store.find("10").unwrap(), None);
    assert_eq!(store.size().unwrap(), 10);
}

#[test]
fn append_concatenates() {
    let scratch = Scratch::new();
    let store = scratch.store(&StoreOptions::default());

    store.append("k", "a").unwrap();
    store.append("k", "b").unwrap();
    store.insert("k2", 1).unwrap();
    store.append("k2", "+2").unwrap();

    assert_eq!(store.find("k").unwrap().as_deref(), Some("ab"));
    assert_eq!(store.find("k2").unwrap().as_deref(), Some("1+2"));
}

#[test]
fn first_construction_wins() {
    let scratch = Scratch::new();
    let first = scratch.store(&StoreOptions::default());
    assert_eq!(first.bucket_count().unwrap(), 3000);

    let options = StoreOptions {
        map: MapOptions {
            buckets: 10,
            fold: KeyFold::AsciiCaseInsensitive,
        },
        ..StoreOptions::default()
    };
    let second = scratch.store(&options);
    assert_eq!(second.bucket_count().unwrap(), 3000);
    assert_eq!(second.map().fold(), KeyFold::Exact);

    second.insert("Key", "v").unwrap();
    assert_eq!(first.find("key").unwrap(), None);
}

#[test]
fn dump_and_entries() {
    let scratch = Scratch::new();
    let store = scratch.store(&StoreOptions::default());
    for key in 0..3 {
        store.insert(key, format!("value {key}")).unwrap();
    }

    let mut entries = store.entries().unwrap();
    entries.sort();
    assert_eq!(
        entries,
        [
            ("0".to_owned(), "value 0".to_owned()),
            ("1".to_owned(), "value 1".to_owned()),
            ("2".to_owned(), "value 2".to_owned()),
        ]
    );

    let mut out = vec![];
    assert_eq!(store.dump(&mut out).unwrap(), 3);
    let mut lines: Vec<_> = String::from_utf8(out).unwrap().lines().map(str::to_owned).collect();
    lines.sort();
    assert_eq!(lines, ["0 value 0", "1 value 1", "2 value 2"]);
}

#[test]
fn destroy_then_find_is_absent() {
    let scratch = Scratch::new();
    let store = scratch.store(&StoreOptions::default());
    let other = scratch.store(&StoreOptions::default());

    for key in 0..10 {
        store.insert(key, "create").unwrap();
    }

    assert!(store.destroy().unwrap());
    assert!(!other.destroy().unwrap());

    for key in 0..10 {
        assert_eq!(store.find(key).unwrap(), None);
        assert_eq!(other.find(key).unwrap(), None);
    }
    assert_eq!(store.size().unwrap(), 0);
    assert!(matches!(store.insert("k", "v"), Err(Error::Destroyed)));
    assert!(matches!(other.append("k", "v"), Err(Error::Destroyed)));

    // Attaching again constructs a new map under the same name.
    let fresh = scratch.store(&StoreOptions::default());
    assert_eq!(fresh.size().unwrap(), 0);
    fresh.insert("k", "v").unwrap();
    assert_eq!(fresh.find("k").unwrap().as_deref(), Some("v"));
    assert_eq!(store.find("k").unwrap(), None);
}

#[test]
fn free_memory_tracks_allocations() {
    let scratch = Scratch::new();
    let store = scratch.store(&StoreOptions::default());

    let mut free = store.free_memory();
    for key in 0..10 {
        store.insert(key, "create").unwrap();
        let now = store.free_memory();
        assert!(now < free, "inserting {key} did not allocate");
        free = now;
    }

    // Values of the same length are overwritten in place.
    for key in 0..10 {
        store.insert(key, "update").unwrap();
    }
    assert_eq!(store.free_memory(), free);

    store.destroy().unwrap();
    assert!(store.free_memory() > free);
}

#[test]
fn exhaustion_keeps_earlier_entries() {
    let scratch = Scratch::new();
    let store = scratch.store(&StoreOptions::new(8192, 16));

    let mut stored = 0;
    let err = loop {
        match store.insert(format!("key-{stored}"), format!("value-{stored}")) {
            Ok(_) => stored += 1,
            Err(err) => break err,
        }
    };

    assert!(err.is_out_of_memory(), "{err:?}");
    assert!(stored > 0);
    assert_eq!(store.size().unwrap(), stored);
    for key in 0..stored {
        assert_eq!(
            store.find(format!("key-{key}")).unwrap(),
            Some(format!("value-{key}"))
        );
    }

    // Space is reusable once entries are removed.
    assert!(store.remove("key-0").unwrap());
    store.insert("key-0", "value-0").unwrap();
}

#[test]
fn attach_with_other_capacity_fails() {
    let scratch = Scratch::new();
    let _store = scratch.store(&StoreOptions::default());

    let options = StoreOptions {
        arena: ArenaOptions::with_capacity(1 << 20),
        ..StoreOptions::default()
    };
    let err = Store::create_or_attach(&scratch.0, "map", &options).unwrap_err();
    assert!(matches!(
        err,
        Error::Arena(shm_hashmap::ArenaError::IncompatibleSize { .. })
    ));
}
