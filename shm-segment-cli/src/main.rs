use std::ffi::OsString;
use std::io::{Read, Write};
use std::path::Path;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use shm_segment::{AccessMode, SharedMemory, DEFAULT_PERMISSIONS};
use tracing_subscriber::EnvFilter;

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let SegmentCommand { key, command } = SegmentCommand::parse();

    let result = match command {
        Command::Create { size, fill, mode } => create(&key, size, fill, mode),
        Command::Read { len } => read(&key, len),
        Command::Write { fill } => write(&key, fill),
        Command::Dump { file } => dump(&key, Path::new(&file)),
        Command::Remove => SharedMemory::remove(&key).map_err(Into::into),
        Command::List => list(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

#[derive(Parser)]
#[command(about = "Create, inspect and remove named shared memory segments")]
struct SegmentCommand {
    /// The logical key of the segment, shared by all processes using it.
    #[arg(long, env = "SHM_SEGMENT_KEY", default_value = "", hide_default_value = true)]
    key: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a segment and keep it alive until standard input is closed.
    ///
    /// Prints `ready` once the segment exists and is filled. The segment is removed on exit.
    Create {
        #[arg(long)]
        size: usize,
        /// Fill the segment with this byte while holding the lock.
        #[arg(long, value_parser = parse_byte)]
        fill: Option<u8>,
        /// Octal permission bits of the segment and its semaphore.
        #[arg(long, value_parser = parse_mode, default_value = "600")]
        mode: libc::mode_t,
    },
    /// Print the contents of a segment as hex.
    Read {
        /// Only print the first bytes.
        #[arg(long)]
        len: Option<usize>,
    },
    /// Fill an existing segment with a byte.
    Write {
        #[arg(long, value_parser = parse_byte)]
        fill: u8,
    },
    /// Copy the contents of a segment into a file, replacing it atomically.
    Dump {
        #[arg(help = "The file to write")]
        file: OsString,
    },
    /// Remove a segment left behind by a creator that did not clean up.
    Remove,
    /// List the segments on this machine with their logical keys and sizes.
    List,
}

fn parse_byte(arg: &str) -> Result<u8, std::num::ParseIntError> {
    match arg.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => arg.parse(),
    }
}

fn parse_mode(arg: &str) -> Result<libc::mode_t, std::num::ParseIntError> {
    libc::mode_t::from_str_radix(arg.trim_start_matches("0o"), 8)
}

fn open(key: &str, mode: AccessMode) -> Result<SharedMemory, shm_segment::Error> {
    let mut memory = SharedMemory::try_with_key(key)?;
    memory.attach(mode)?;
    Ok(memory)
}

fn create(key: &str, size: usize, fill: Option<u8>, mode: libc::mode_t) -> CliResult {
    let mut memory = SharedMemory::try_with_key(key)?;
    if mode != DEFAULT_PERMISSIONS {
        memory.set_permissions(mode)?;
    }
    memory.create(size, AccessMode::ReadWrite)?;

    if let Some(byte) = fill {
        let mut guard = memory.locked()?;
        if let Some(bytes) = guard.as_mut_slice() {
            bytes.fill(byte);
        }
    }

    let mut stdout = std::io::stdout();
    writeln!(stdout, "ready")?;
    stdout.flush()?;

    // Hold the segment until our parent is done with it.
    std::io::stdin().read_to_end(&mut Vec::new())?;

    memory.detach()?;
    Ok(())
}

fn read(key: &str, len: Option<usize>) -> CliResult {
    let mut memory = open(key, AccessMode::ReadOnly)?;

    let hex = {
        let guard = memory.locked()?;
        let bytes = guard.as_slice();
        let bytes = &bytes[..len.map_or(bytes.len(), |len| len.min(bytes.len()))];
        bytes.iter().map(|b| format!("{b:02x}")).collect::<String>()
    };

    println!("{hex}");
    Ok(())
}

fn write(key: &str, fill: u8) -> CliResult {
    let mut memory = open(key, AccessMode::ReadWrite)?;
    let mut guard = memory.locked()?;
    if let Some(bytes) = guard.as_mut_slice() {
        bytes.fill(fill);
    }

    Ok(())
}

fn dump(key: &str, file: &Path) -> CliResult {
    let parent = match file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    // Write everything into a temporary file first, the target only ever holds a complete copy.
    let mut pending = tempfile::NamedTempFile::new_in(parent)?;

    {
        let mut memory = open(key, AccessMode::ReadOnly)?;
        let guard = memory.locked()?;
        pending.write_all(guard.as_slice())?;
    }

    pending.as_file().sync_all()?;
    pending.persist(file)?;
    tracing::debug!(?file, "dumped segment");
    Ok(())
}

#[cfg(target_os = "linux")]
fn list() -> CliResult {
    for entry in std::fs::read_dir("/dev/shm")? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(native) = name.to_str().and_then(shm_segment::NativeKey::from_native) else {
            continue;
        };

        let size = entry.metadata()?.len();
        println!("{}\t{size}", native.logical());
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn list() -> CliResult {
    Err("listing segments requires /dev/shm".into())
}
