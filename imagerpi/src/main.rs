use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use imagerpi_core::capture::{self, CaptureOptions};
use imagerpi_core::copy::Cancelled;
use imagerpi_core::deploy;
use imagerpi_core::filesystem::E2fsprogs;
use imagerpi_core::shrink::ShrinkOutcome;
use imagerpi_core::size::parse_size;
use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::{IsTerminal, stdout};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

#[derive(Parser)]
#[command(name = "imagerpi")]
#[command(about = "Capture or deploy images to SD cards", version)]
struct Cli {
    /// Use a transfer buffer of size SIZE. Accepts suffixes of B, K, M, or G.
    #[arg(
        short,
        long,
        value_name = "SIZE",
        default_value = "512K",
        value_parser = buffer_size,
        global = true
    )]
    buffer_size: usize,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a device to an image file, shrinking its last partition first
    Capture {
        /// Source disk
        #[arg(value_parser = block_device)]
        src: PathBuf,

        /// Destination file
        dest: PathBuf,

        /// Don't copy to dest
        #[arg(long)]
        no_copy: bool,

        /// Skip the filesystem shrinking step
        #[arg(long)]
        no_shrink: bool,

        /// Shrink the last partition's filesystem to include a minimum of SIZE
        /// free space. Accepts suffixes of B, K, M, or G.
        #[arg(short, long, value_name = "SIZE", default_value = "500M", value_parser = size)]
        free: u64,

        /// Overwrite an existing destination without asking
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Deploy an image file to a device
    Deploy {
        /// Source file
        src: PathBuf,

        /// Destination disk
        #[arg(value_parser = block_device)]
        dest: PathBuf,

        /// Read the device back and compare it with the image
        #[arg(long)]
        verify: bool,

        /// Don't ask before erasing the destination
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// List removable devices
    List {
        /// Include fixed disks
        #[arg(short, long)]
        all: bool,
    },
}

fn block_device(s: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(s);
    imagerpi_core::device::require_block_device(&path).map_err(|e| e.to_string())?;
    Ok(path)
}

fn size(s: &str) -> Result<u64, String> {
    parse_size(s).map_err(|e| e.to_string())
}

fn buffer_size(s: &str) -> Result<usize, String> {
    let bytes = size(s)?;
    if bytes == 0 {
        return Err("buffer size must be greater than zero".to_string());
    }
    usize::try_from(bytes).map_err(|_| format!("buffer size '{s}' is too large"))
}

/// Disables `ECHOCTL` on the terminal while alive, so Ctrl+C does not leave
/// a stray `^C` in front of the cancellation message.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            let mut original_termios = None;
            if stdout().is_terminal() {
                let fd = stdout().as_raw_fd();
                if let Ok(original) = Termios::from_fd(fd) {
                    let mut quiet = original;
                    quiet.c_lflag &= !ECHOCTL;
                    if tcsetattr(fd, TCSANOW, &quiet).is_ok() {
                        original_termios = Some(original);
                    }
                }
            }
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, original_termios).ok();
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

fn confirm(prompt: &str, default: bool) -> Result<bool> {
    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(default)
        .interact()?)
}

/// A byte-counting bar that stays hidden until [`start_bar`] is called.
fn transfer_bar(prefix: &'static str, color: &str) -> Result<ProgressBar> {
    let bar = ProgressBar::hidden();
    bar.set_prefix(prefix);
    bar.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}})"
            ))?
            .progress_chars("■ "),
    );
    Ok(bar)
}

fn start_bar(bar: &ProgressBar, len: u64) {
    bar.set_length(len);
    bar.set_draw_target(ProgressDrawTarget::stderr());
}

fn sync_filesystems() {
    println!("Operation completed. Syncing filesystems...");
    #[cfg(unix)]
    unsafe {
        libc::sync();
    }
    println!("Done.");
}

fn capture_options(buffer_size: usize, no_copy: bool, no_shrink: bool, free: u64) -> CaptureOptions {
    CaptureOptions {
        buffer_size,
        free_space: (!no_shrink).then_some(free),
        copy: !no_copy,
    }
}

/// Whether a capture may go ahead given what is already at `dest`. Only an
/// existing file that will be written to needs `ask`, and `-y` answers it.
fn may_overwrite(
    dest: &Path,
    copy: bool,
    yes: bool,
    ask: impl FnOnce(&str) -> Result<bool>,
) -> Result<bool> {
    if !copy || yes || !dest.is_file() {
        return Ok(true);
    }
    ask(&format!("File: '{}' already exists. Overwrite?", dest.display()))
}

fn run_capture(
    src: PathBuf,
    dest: PathBuf,
    options: CaptureOptions,
    yes: bool,
    running: Arc<AtomicBool>,
) -> Result<()> {
    if !may_overwrite(&dest, options.copy, yes, |prompt| confirm(prompt, true))? {
        println!("Operation aborted.");
        return Ok(());
    }

    println!("  Device: {}", style(src.display()).cyan());
    if options.copy {
        println!("  Output: {}", style(dest.display()).cyan());
    }
    match options.free_space {
        Some(free) => println!("  Shrink: leaving {} free", HumanBytes(free)),
        None => println!("  Shrink: skipped"),
    }
    println!();

    let read_pb = transfer_bar("Capturing", "green")?;
    let result = capture::run(
        &src,
        &dest,
        &options,
        &E2fsprogs,
        running,
        |len| start_bar(&read_pb, len),
        |bytes| read_pb.set_position(bytes),
    );

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            read_pb.finish_and_clear();
            return Err(e);
        }
    };

    if report.copied {
        read_pb.finish_with_message("Capture complete.");
    } else {
        read_pb.finish_and_clear();
    }

    if let Some(shrink) = &report.shrink {
        match &shrink.outcome {
            ShrinkOutcome::Shrunk { from, to } => println!(
                "Shrank {} from {} to {}.",
                style(shrink.partition.display()).cyan(),
                HumanBytes(*from),
                HumanBytes(*to)
            ),
            ShrinkOutcome::AlreadyMinimal => println!(
                "{} is already at its minimum size.",
                style(shrink.partition.display()).cyan()
            ),
            ShrinkOutcome::Skipped(reason) => println!("Resize skipped: {reason}."),
        }
    }

    if report.copied {
        println!(
            "\n✨ Captured {} of {} to {}.",
            HumanBytes(report.length),
            style(src.display()).cyan(),
            style(dest.display()).cyan()
        );
    } else {
        println!("Image would be {} ({} bytes).", HumanBytes(report.length), report.length);
    }

    sync_filesystems();
    Ok(())
}

fn run_deploy(
    src: PathBuf,
    dest: PathBuf,
    buffer_size: usize,
    verify: bool,
    yes: bool,
    running: Arc<AtomicBool>,
) -> Result<()> {
    println!(
        "{} This will overwrite the start of '{}'.",
        style("WARNING:").red().bold(),
        dest.display()
    );
    println!("  Image:  {}", style(src.display()).cyan());
    println!("  Device: {}", style(dest.display()).cyan());
    println!();

    if !yes && !confirm("Are you sure you want to proceed?", false)? {
        println!("Operation aborted.");
        return Ok(());
    }

    let write_pb = transfer_bar("Deploying", "green")?;
    let verify_pb = transfer_bar("Verifying", "magenta")?;

    let result = deploy::run(
        &src,
        &dest,
        buffer_size,
        verify,
        running,
        |len| start_bar(&write_pb, len),
        |bytes| write_pb.set_position(bytes),
        |len| {
            write_pb.finish_with_message("Write complete.");
            start_bar(&verify_pb, len);
        },
        |bytes| verify_pb.set_position(bytes),
    );

    match result {
        Ok(()) => {
            if verify {
                verify_pb.finish_with_message("Verification successful.");
            } else {
                write_pb.finish_with_message("Write complete.");
            }
            println!(
                "\n✨ Deployed {} to {}.",
                style(src.display()).cyan(),
                style(dest.display()).cyan()
            );
        }
        Err(e) => {
            write_pb.finish_and_clear();
            verify_pb.finish_and_clear();
            return Err(e);
        }
    }

    sync_filesystems();
    Ok(())
}

fn list_devices(all: bool) -> Result<()> {
    let (devices, kind) = if all {
        (imagerpi_core::platform::get_block_devices()?, "")
    } else {
        (imagerpi_core::platform::get_removable_devices()?, "removable ")
    };
    if devices.is_empty() {
        println!("No {kind}devices found.");
        return Ok(());
    }

    println!("Found {} {kind}devices:", devices.len());
    println!("\n  {:<16} {:<12} {:<10} LOCATION", "DEVICE", "NAME", "SIZE");
    println!("  {:-<16} {:-<12} {:-<10} {:-<20}", "", "", "", "");
    for device in devices {
        let mut location = if device.mount_points.is_empty() {
            "(Not mounted)".to_string()
        } else {
            device
                .mount_points
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        if !device.removable {
            location.push_str(" [Fixed]");
        }
        println!(
            "  {:<16} {:<12} {:>7.1} GB  {}",
            device.path.display(),
            device.name,
            device.size_gb(),
            location
        );
    }
    Ok(())
}

fn dispatch(cli: Cli, running: Arc<AtomicBool>) -> Result<()> {
    tracing::debug!("Buffer Size: {}", cli.buffer_size);

    match cli.command {
        Commands::Capture {
            src,
            dest,
            no_copy,
            no_shrink,
            free,
            yes,
        } => {
            tracing::debug!("Source: {}", src.display());
            tracing::debug!("Destination: {}", dest.display());
            let options = capture_options(cli.buffer_size, no_copy, no_shrink, free);
            run_capture(src, dest, options, yes, running)
        }
        Commands::Deploy {
            src,
            dest,
            verify,
            yes,
        } => {
            tracing::debug!("Source: {}", src.display());
            tracing::debug!("Destination: {}", dest.display());
            if !src.is_file() {
                return Err(anyhow!("{} is not a file", src.display()));
            }
            run_deploy(src, dest, cli.buffer_size, verify, yes, running)
        }
        Commands::List { all } => list_devices(all),
    }
}

fn main() -> Result<()> {
    // Restores the terminal when main() exits.
    let _term_restorer = TermRestorer::new();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let cli = Cli::parse();
    init_logging(cli.verbose);

    match dispatch(cli, running) {
        Err(e) if e.is::<Cancelled>() => {
            eprintln!("\n{}", style("Operation cancelled.").yellow());
            std::process::exit(130);
        }
        other => other,
    }
}
