//! fibra - CLI

use std::io::{Read, Write};
use std::os::fd::IntoRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fibra::runtime::{DirectScheduler, Descriptor, InterruptHandle, Scheduler};
use fibra::util::config::{self, FibraConfig};
use fibra::util::logger::{self, LogLevel};
use fibra::{NAME, VERSION};
use tracing::info;

/// Cooperative fibers over a pluggable event selector
#[derive(Parser, Debug)]
#[command(name = "fibra")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Spawn tasks that sleep, then drain the scheduler
    Sleep {
        /// Number of tasks
        #[arg(short, long, default_value_t = 4)]
        tasks: u64,

        /// Base sleep per task; task `i` sleeps `i * millis`
        #[arg(short, long, default_value_t = 50)]
        millis: u64,
    },

    /// Stream messages between two tasks over a socket pair
    Pipe {
        /// Number of messages
        #[arg(short, long, default_value_t = 16)]
        messages: usize,
    },

    /// Print the effective configuration
    Config,

    /// Print version information
    Version,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let path = args.config.clone().unwrap_or_else(|| PathBuf::from(config::CONFIG_FILE));
    let config = config::load_config(&path)
        .with_context(|| format!("Failed to load config: {}", path.display()))?
        .with_env();

    let level = if args.verbose {
        LogLevel::Debug
    } else {
        config.log.level
    };
    logger::init_with_level(level);

    match args.command {
        Commands::Sleep { tasks, millis } => sleep(&config, tasks, millis)?,
        Commands::Pipe { messages } => pipe(&config, messages)?,
        Commands::Config => {
            print!("{}", config::to_toml_string(&config)?);
        }
        Commands::Version => {
            println!("{} {}", NAME, VERSION);
        }
    }

    Ok(())
}

fn sleep(
    config: &FibraConfig,
    tasks: u64,
    millis: u64,
) -> Result<()> {
    let scheduler = Arc::new(Scheduler::from_config(config.scheduler.clone()));
    raise_on_sigint(scheduler.interrupt_handle())?;
    let started = Instant::now();

    for i in 0..tasks {
        let sched = scheduler.clone();
        scheduler.spawn(move || {
            sched.kernel_sleep(Some(Duration::from_millis(i * millis)))?;
            info!("task {} woke after {:?}", i, started.elapsed());
            Ok(())
        })?;
    }

    scheduler.close().context("Failed to drain scheduler")?;
    finish(&scheduler)?;
    println!("{} tasks finished in {:?}", tasks, started.elapsed());
    Ok(())
}

fn pipe(
    config: &FibraConfig,
    messages: usize,
) -> Result<()> {
    let scheduler = Arc::new(DirectScheduler::from_config(config.scheduler.clone()));
    raise_on_sigint(scheduler.interrupt_handle())?;
    let (writer, reader) = UnixStream::pair().context("Failed to create socket pair")?;
    writer.set_nonblocking(true)?;
    reader.set_nonblocking(true)?;

    let received = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    let sched = scheduler.clone();
    scheduler.spawn(move || {
        let descriptor = Descriptor::of(&writer);
        for i in 0..messages {
            let mut line = Vec::new();
            writeln!(line, "message {}", i)?;
            sched.io_write(descriptor, &line, line.len(), None)?;
        }
        // Dropping the writer closes it; the reader then sees end of stream.
        drop(writer);
        Ok(())
    })?;

    let sched = scheduler.clone();
    let total = received.clone();
    scheduler.spawn(move || {
        let descriptor = Descriptor::of(&reader);
        let mut buffer = [0u8; 512];
        loop {
            let n = sched.io_read(descriptor, &mut buffer, 0, None)?;
            if n == 0 {
                break;
            }
            total.fetch_add(n, Ordering::SeqCst);
        }
        Ok(())
    })?;

    scheduler.close().context("Failed to drain scheduler")?;
    finish(&scheduler)?;
    println!(
        "{} messages, {} bytes in {:?}",
        messages,
        received.load(Ordering::SeqCst),
        started.elapsed()
    );
    Ok(())
}

/// Cancel whatever an interrupted drain left parked.
fn finish(scheduler: &Scheduler) -> Result<()> {
    if scheduler.interrupt_handle().is_raised() {
        let cancelled = scheduler.shutdown().context("Failed to shut down scheduler")?;
        println!("interrupted, {} tasks cancelled", cancelled);
    }
    Ok(())
}

/// Write end of the pipe the SIGINT handler signals through.
static SIGINT_PIPE: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_sigint(_signal: libc::c_int) {
    static BYTE: u8 = 1;
    let fd = SIGINT_PIPE.load(Ordering::SeqCst);
    if fd >= 0 {
        // SAFETY: write(2) is async-signal-safe and `BYTE` is a static.
        unsafe {
            libc::write(fd, (&BYTE as *const u8).cast(), 1);
        }
    }
}

/// Raise `handle` when the process receives SIGINT.
///
/// The handler itself only writes a byte; a watcher thread does the raise.
fn raise_on_sigint(handle: InterruptHandle) -> Result<()> {
    let (mut reader, writer) = UnixStream::pair().context("Failed to create signal pipe")?;
    SIGINT_PIPE.store(writer.into_raw_fd(), Ordering::SeqCst);

    // SAFETY: `on_sigint` only touches an atomic and calls write(2).
    let previous = unsafe { libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t) };
    if previous == libc::SIG_ERR {
        return Err(std::io::Error::last_os_error()).context("Failed to install SIGINT handler");
    }

    thread::Builder::new()
        .name("fibra-sigint".to_string())
        .spawn(move || {
            let mut byte = [0u8; 1];
            if matches!(reader.read(&mut byte), Ok(n) if n > 0) {
                info!("interrupted, stopping the drain");
                handle.raise();
            }
        })
        .context("Failed to spawn signal watcher")?;
    Ok(())
}
