//! The `create`, `update`, `read` and `destroy` runs of the command line harness, each in its own
//! process against one arena.
#![cfg(all(feature = "cli", target_os = "linux"))]
use assert_cmd::Command;

struct Harness {
    arena: String,
}

impl Harness {
    fn new(test: &str) -> Self {
        Harness {
            arena: format!("/shm-hashmap-cli-{test}-{}", std::process::id()),
        }
    }

    fn run(&self, op: &str, id: &str) -> String {
        let output = Command::new(env!("CARGO_BIN_EXE_shm-hashmap"))
            .args([op, id, "--arena", &self.arena])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();

        String::from_utf8(output).unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = shm_hashmap::Arena::remove(&self.arena);
    }
}

fn free_memory(output: &str) -> Vec<usize> {
    output
        .lines()
        .filter_map(|line| line.split_once("Free Memory: [")?.1.split_once(']'))
        .map(|(bytes, _)| bytes.parse().unwrap())
        .collect()
}

#[test]
fn create_update_read_destroy() {
    let harness = Harness::new("scenario");

    let created = harness.run("create", "first");
    let free = free_memory(&created);
    assert_eq!(free.len(), 2);
    assert!(free[1] < free[0], "{created}");
    assert!(created.contains("first create : Size: 10"));
    let lines: Vec<_> = created.lines().collect();
    assert_eq!(lines.first(), Some(&"first create : Creating"));
    assert_eq!(lines.last(), Some(&"first create : Creating done"));
    for key in 0..10 {
        assert!(created.contains(&format!("first create : Creating: Shm Hash: {key} -> create")));
    }

    let read = harness.run("r", "reader");
    for key in 0..10 {
        assert!(read.contains(&format!("reader read : Reading Shm Hash: {key} -> create")));
    }

    let updated = harness.run("u", "second");
    assert!(updated.contains("second update : Updating: Shm Hash: 3 -> second"));
    assert!(updated.contains("second update : Updating done"));
    let read = harness.run("read", "reader");
    for key in 0..10 {
        assert!(read.contains(&format!("reader read : Reading Shm Hash: {key} -> second")));
    }

    let destroyed = harness.run("d", "last");
    assert!(destroyed.contains("last destroy : Destroyed: true"));
    for key in 0..10 {
        assert!(destroyed.contains(&format!("last destroy : Absent: {key}")));
    }
}

#[test]
fn append_and_dump() {
    let harness = Harness::new("append");

    harness.run("c", "base");
    let appended = harness.run("a", "x");
    assert!(appended.starts_with("x append : Appending\n"));
    assert!(appended.contains("x append : Appending: Shm Hash: 9 -> +x"));
    assert!(appended.contains("x append : Appending done"));
    let dumped = harness.run("v", "viewer");

    assert!(dumped.contains("viewer dump : Size: 10"));
    for key in 0..10 {
        assert!(dumped.contains(&format!("viewer dump : {key} create+x")));
    }
}

#[test]
fn create_starts_over() {
    let harness = Harness::new("recreate");

    harness.run("c", "one");
    harness.run("u", "changed");
    harness.run("c", "two");

    let read = harness.run("r", "reader");
    assert!(read.contains("reader read : Reading Shm Hash: 0 -> create"));
    assert!(!read.contains("changed"));
}

#[test]
fn unknown_operation_fails() {
    Command::new(env!("CARGO_BIN_EXE_shm-hashmap"))
        .args(["explode", "id"])
        .assert()
        .failure();
}
