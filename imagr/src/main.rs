mod sink;

use anyhow::{Context, Result, anyhow};
use clap::{ArgAction, Parser, Subcommand};
use console::style;
use dialoguer::{Select, theme::ColorfulTheme};
use imagr_core::config::{ImagingConfig, Sizing};
use imagr_core::controller::OperationController;
use imagr_core::device::Device;
use imagr_core::error::ImagingError;
use imagr_core::hash::HashAlgorithm;
use imagr_core::platform::{self, NativeBackend};
use imagr_core::transfer::Outcome;
use sink::TerminalSink;
use std::fs::{self, File};
use std::io::{IsTerminal, stdout};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

const EXIT_CANCELED: u8 = 130;

#[derive(Parser)]
#[command(name = "imagr")]
#[command(about = "Read, write and verify raw volume images", version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only print errors and results
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Write log output to a file instead of stderr
    #[arg(long, value_name = "FILE", global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a device into an image file
    Read {
        /// Output image file
        #[arg(required = true)]
        image: PathBuf,

        /// Source device (prompted for if omitted)
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// Only read up to the end of the last partition
        #[arg(short, long = "allocated-only")]
        allocated_only: bool,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Write an image file to a device
    Write {
        /// Image file to write
        #[arg(required = true)]
        image: PathBuf,

        /// Target device (prompted for if omitted)
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// Skip write verification
        #[arg(short = 'n', long = "no-verify")]
        no_verify: bool,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Compare an image file with the contents of a device
    Verify {
        /// Image file to compare against
        #[arg(required = true)]
        image: PathBuf,

        /// Device to verify (prompted for if omitted)
        #[arg(short, long)]
        device: Option<PathBuf>,
    },
    /// Print the hash of an image file
    Hash {
        /// Image file to hash
        #[arg(required = true)]
        image: PathBuf,

        /// md5, sha1 or sha256
        #[arg(short = 'x', long, default_value_t = HashAlgorithm::Sha256)]
        algorithm: HashAlgorithm,

        /// Also write the digest to this file
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// List available removable devices
    List,
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`.
/// The original terminal state is restored when this struct is dropped.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            let fd = stdout().as_raw_fd();
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }

            let original_termios = Termios::from_fd(fd).ok().and_then(|original| {
                let mut quiet = original;
                quiet.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &quiet).ok().map(|_| original)
            });
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
            let fd = stdout().as_raw_fd();
            tcsetattr(fd, TCSANOW, original_termios).ok();
        }
    }
}

fn init_logging(verbose: u8, quiet: bool, log_file: Option<&Path>) -> Result<()> {
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("IMAGR_LOG").unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("cannot create log file {}", path.display()))?;
            builder.with_writer(Mutex::new(file)).with_ansi(false).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[Device], prompt: &str) -> Result<Device> {
    if devices.is_empty() {
        return Err(anyhow!("No removable devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

fn resolve_device(device: Option<PathBuf>, prompt: &str) -> Result<PathBuf> {
    match device {
        Some(path) => Ok(path),
        None => {
            let devices = platform::get_removable_devices()?;
            Ok(select_device(&devices, prompt)?.path)
        }
    }
}

fn new_controller(
    quiet: bool,
    config: ImagingConfig,
) -> Result<OperationController<NativeBackend, TerminalSink>> {
    let controller = OperationController::new(NativeBackend, TerminalSink::new(quiet), config)?;

    // Ctrl+C stops the running operation at the next chunk boundary.
    let control = controller.control_handle();
    ctrlc::set_handler(move || control.cancel())?;

    Ok(controller)
}

fn exit_code(result: &imagr_core::Result<Outcome>) -> ExitCode {
    match result {
        Ok(Outcome::Completed) => ExitCode::SUCCESS,
        Ok(Outcome::Canceled) | Err(ImagingError::Declined) => ExitCode::from(EXIT_CANCELED),
        Err(e) => {
            // The sink has already shown the warning; add the detail.
            if e.warning().is_some() {
                eprintln!("  {}", style(e).dim());
            } else {
                eprintln!("{} {e}", style("Error:").red().bold());
            }
            ExitCode::FAILURE
        }
    }
}

fn print_plan(quiet: bool, device: &Path, image: &Path) {
    if quiet {
        return;
    }
    println!("  Device: {}", style(device.display()).cyan());
    println!("  Image:  {}", style(image.display()).cyan());
    println!();
}

fn list_devices() -> Result<()> {
    let devices = platform::get_removable_devices()?;
    if devices.is_empty() {
        println!("No removable devices found.");
        return Ok(());
    }

    println!("Found {} removable devices:", devices.len());
    println!(
        "\n  {:<12} {:<25} {:<10} {}",
        "DEVICE", "NAME", "SIZE", "LOCATION"
    );
    println!("  {:-<12} {:-<25} {:-<10} {:-<20}", "", "", "", "");
    for device in devices {
        let location = if device.mount_points.is_empty() {
            "(Not mounted)".to_string()
        } else {
            device
                .mount_points
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        println!(
            "  {:<12} {:<25} {:>8.1} GB  {}",
            device.path.display(),
            device.name,
            device.size_gb(),
            location
        );
    }
    Ok(())
}

fn run(command: Commands, quiet: bool) -> Result<ExitCode> {
    match command {
        Commands::Read {
            image,
            device,
            allocated_only,
            yes,
        } => {
            let device = resolve_device(device, "Select the source device to READ from")?;
            print_plan(quiet, &device, &image);

            let config = ImagingConfig {
                sizing: if allocated_only {
                    Sizing::AllocatedPartitions
                } else {
                    Sizing::FullDevice
                },
                skip_confirmations: yes,
                ..Default::default()
            };
            let mut controller = new_controller(quiet, config)?;
            let result = controller.read(&device, &image);
            if matches!(result, Ok(Outcome::Completed)) && !quiet {
                println!(
                    "\n✨ Successfully read {} to {}.",
                    style(device.display()).cyan(),
                    style(image.display()).cyan()
                );
            }
            Ok(exit_code(&result))
        }
        Commands::Write {
            image,
            device,
            no_verify,
            yes,
        } => {
            let device = resolve_device(device, "Select the target device to WRITE to")?;
            print_plan(quiet, &device, &image);

            let config = ImagingConfig {
                skip_confirmations: yes,
                ..Default::default()
            };
            let mut controller = new_controller(quiet, config)?;
            let mut result = controller.write(&device, &image);
            if matches!(result, Ok(Outcome::Completed)) && !no_verify {
                result = controller.verify(&device, &image);
            }
            if matches!(result, Ok(Outcome::Completed)) && !quiet {
                println!(
                    "\n✨ Successfully flashed {} with {}.",
                    style(device.display()).cyan(),
                    style(image.display()).cyan()
                );
            }
            Ok(exit_code(&result))
        }
        Commands::Verify { image, device } => {
            let device = resolve_device(device, "Select the device to VERIFY")?;
            print_plan(quiet, &device, &image);

            let mut controller = new_controller(quiet, ImagingConfig::default())?;
            let result = controller.verify(&device, &image);
            Ok(exit_code(&result))
        }
        Commands::Hash {
            image,
            algorithm,
            output,
        } => {
            let mut controller = new_controller(quiet, ImagingConfig::default())?;
            let result = match controller.hash(&image, algorithm) {
                Ok(result) => result,
                Err(e) => return Ok(exit_code(&Err(e))),
            };

            let file_name = image
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let line = format!("{}  {}", result.hex, file_name);
            println!("{line}");
            if let Some(output) = output {
                fs::write(&output, format!("{line}\n"))
                    .with_context(|| format!("cannot write {}", output.display()))?;
                if !quiet {
                    println!("{} digest written to {}", result.algorithm, output.display());
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::List => {
            list_devices()?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.verbose, cli.quiet, cli.log_file.as_deref()) {
        eprintln!("{} {e:#}", style("Error:").red().bold());
        return ExitCode::FAILURE;
    }

    match run(cli.command, cli.quiet) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", style("Error:").red().bold());
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_write_flags() {
        let cli = Cli::parse_from(["imagr", "-vv", "write", "disk.img", "-d", "/dev/sdz", "-n", "-y"]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Write {
                image,
                device,
                no_verify,
                yes,
            } => {
                assert_eq!(image, PathBuf::from("disk.img"));
                assert_eq!(device, Some(PathBuf::from("/dev/sdz")));
                assert!(no_verify);
                assert!(yes);
            }
            _ => panic!("expected write"),
        }
    }

    #[test]
    fn hash_defaults_to_sha256() {
        let cli = Cli::parse_from(["imagr", "hash", "disk.img"]);
        match cli.command {
            Commands::Hash { algorithm, output, .. } => {
                assert_eq!(algorithm, HashAlgorithm::Sha256);
                assert_eq!(output, None);
            }
            _ => panic!("expected hash"),
        }
        assert!(Cli::try_parse_from(["imagr", "hash", "disk.img", "-x", "crc32"]).is_err());
    }
}
