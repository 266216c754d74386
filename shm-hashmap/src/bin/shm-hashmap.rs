use std::io::Write;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use shm_hashmap::{Arena, Store, StoreOptions};
use tracing_subscriber::EnvFilter;

/// Run one operation against a string map shared with other invocations.
#[derive(Parser)]
struct Command {
    #[arg(value_enum)]
    op: Op,
    /// Names this run in the output; the value stored by `update` and `append`.
    id: String,
    /// Name of the shared memory arena.
    #[arg(long, default_value = "/shm-hashmap")]
    arena: String,
    /// Name of the map inside the arena.
    #[arg(long, default_value = "strings")]
    map: String,
    /// Arena size in bytes, when creating it.
    #[arg(long, default_value_t = 655_350)]
    capacity: usize,
    /// Initial buckets, when creating the map.
    #[arg(long, default_value_t = 3000)]
    buckets: usize,
    /// Operate on the keys `0` up to this number.
    #[arg(long, default_value_t = 10)]
    records: usize,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Op {
    /// Start over with a fresh arena and set every key to `create`.
    #[value(alias = "c")]
    Create,
    /// Set every key to the run id.
    #[value(alias = "u")]
    Update,
    /// Append `+ID` to every key.
    #[value(alias = "a")]
    Append,
    /// Print every key that is present.
    #[value(alias = "r")]
    Read,
    /// Print all entries.
    #[value(alias = "v")]
    Dump,
    /// Destroy the map and check that the keys are gone.
    #[value(alias = "d")]
    Destroy,
}

impl Op {
    fn name(self) -> &'static str {
        match self {
            Op::Create => "create",
            Op::Update => "update",
            Op::Append => "append",
            Op::Read => "read",
            Op::Dump => "dump",
            Op::Destroy => "destroy",
        }
    }

    /// Opens and closes the output of a run.
    fn banner(self) -> &'static str {
        match self {
            Op::Create => "Creating",
            Op::Update => "Updating",
            Op::Append => "Appending",
            Op::Read => "Reading",
            Op::Dump => "Dumping",
            Op::Destroy => "Destroying",
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let command = Command::parse();
    match run(&command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(op = command.op.name(), id = %command.id, "{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: &Command) -> shm_hashmap::Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let prefix = format!("{} {} :", command.id, command.op.name());
    let banner = command.op.banner();
    writeln!(out, "{prefix} {banner}")?;

    if command.op == Op::Create {
        Arena::remove(&command.arena)?;
    }

    let options = StoreOptions::new(command.capacity, command.buckets);
    let store = Store::create_or_attach(&command.arena, &command.map, &options)?;
    let keys = 0..command.records;

    match command.op {
        Op::Create | Op::Update | Op::Append => {
            writeln!(out, "{prefix} Free Memory: [{}] bytes", store.free_memory())?;

            for key in keys {
                let value = match command.op {
                    Op::Create => "create".to_owned(),
                    Op::Update => command.id.clone(),
                    _ => format!("+{}", command.id),
                };

                writeln!(out, "{prefix} {banner}: Shm Hash: {key} -> {value}")?;
                if command.op == Op::Append {
                    store.append(key, value)?;
                } else {
                    store.insert(key, value)?;
                }
            }

            writeln!(out, "{prefix} Free Memory: [{}] bytes", store.free_memory())?;
            writeln!(out, "{prefix} Size: {}", store.size()?)?;
        }
        Op::Read => {
            for key in keys {
                if let Some(value) = store.find(key)? {
                    writeln!(out, "{prefix} Reading Shm Hash: {key} -> {value}")?;
                }
            }
        }
        Op::Dump => {
            writeln!(out, "{prefix} Size: {}", store.size()?)?;
            for (key, value) in store.entries()? {
                writeln!(out, "{prefix} {key} {value}")?;
            }
        }
        Op::Destroy => {
            writeln!(out, "{prefix} Destroyed: {}", store.destroy()?)?;

            for key in keys {
                match store.find(key)? {
                    Some(value) => writeln!(out, "{prefix} Still present: {key} -> {value}")?,
                    None => writeln!(out, "{prefix} Absent: {key}")?,
                }
            }
        }
    }

    writeln!(out, "{prefix} {banner} done")?;
    Ok(())
}
