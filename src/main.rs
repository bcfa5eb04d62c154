//! ddloader - main entry point
//!
//! Parses the command line, loads the configuration, sets up logging and
//! dispatches to the library entry points.

use anyhow::{Context, Result};
use ddloader::acquisition::{MediaRequest, load_driver_disks, load_driver_from_media};
use ddloader::cli::{Cli, Commands};
use ddloader::config::LoaderConfig;
use ddloader::context::LoaderContext;
use ddloader::devices::DeviceClass;
use ddloader::disk::Verifier;
use ddloader::modules::running_kernel_version;
use ddloader::package::PackageReader;
use ddloader::prompt::{HeadlessPrompter, Prompter};
use ddloader::sources::{
    BootOptions, KickstartDriverDisk, boot_sequence, load_from_device, load_from_partition,
    load_from_source, load_kickstart_disks, load_labelled_disks,
};
use ddloader::ui::TuiPrompter;
use ddloader::unpack::extract_packages_from;
use ddloader::{preflight, process_guard};
use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::process::ExitCode;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

/// Initialize tracing: `RUST_LOG` overrides the `info` default.
///
/// Dialogs own the terminal, so interactive runs log to a file.
fn init_logging(headless: bool, log_file: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let writer = match (headless, log_file) {
        (false, Some(path)) => match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => BoxMakeWriter::new(std::sync::Mutex::new(file)),
            Err(e) => {
                eprintln!("ddloader: cannot open log file {}: {}", path.display(), e);
                BoxMakeWriter::new(io::sink)
            }
        },
        (false, None) => BoxMakeWriter::new(io::sink),
        (true, _) => BoxMakeWriter::new(io::stderr),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(headless)
        .with_target(false)
        .init();
}

/// Configuration file (or defaults) with command-line overrides applied.
fn load_config(cli: &Cli) -> Result<LoaderConfig> {
    let mut config = match &cli.config {
        Some(path) => LoaderConfig::load_from_file(path)?,
        None => LoaderConfig::default(),
    };
    if let Some(log_file) = &cli.log_file {
        config.log_file = Some(log_file.clone());
    }
    if cli.no_probe {
        config.no_probe = true;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn parse_class(class: &str) -> Result<DeviceClass> {
    class
        .parse()
        .with_context(|| format!("Unknown device class {:?}", class))
}

fn main() -> ExitCode {
    let cli = Cli::parse_args();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ddloader: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    init_logging(cli.headless, config.log_file.as_deref());
    info!("ddloader {} starting up", env!("CARGO_PKG_VERSION"));

    // Helpers are stopped and we exit with 128+signal on SIGINT/SIGTERM/SIGHUP
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }

    match run(cli, config) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("ddloader: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Run the selected command; `Ok` carries the process exit status.
fn run(cli: Cli, config: LoaderConfig) -> Result<u8> {
    let command = cli.command.unwrap_or(Commands::Interactive {
        class: "any".to_string(),
    });
    debug!("Command: {:?}", command);

    // Commands that only read files never touch the running system
    match command {
        Commands::Verify { dir } => return verify_dir(&config, &dir),
        Commands::Extract { dir, dest, kernel } => {
            let kernel = kernel.unwrap_or_else(running_kernel_version);
            return extract_dir(&dir, &dest, &kernel);
        }
        Commands::Inspect { package } => return inspect_package(&package),
        _ => {}
    }

    let report = preflight::verify_environment();
    if !report.is_ok() {
        preflight::print_failure(&report);
        return Ok(1);
    }

    let interactive = !cli.headless;
    let prompter: Box<dyn Prompter> = if interactive {
        Box::new(TuiPrompter::new().context("Failed to set up the terminal")?)
    } else {
        Box::new(HeadlessPrompter)
    };
    let mut ctx = LoaderContext::system(config, prompter);

    match command {
        Commands::Interactive { class } => {
            load_driver_disks(&mut ctx, parse_class(&class)?)?;
        }
        Commands::Media { class, cancel } => {
            let request = MediaRequest {
                class: parse_class(&class)?,
                use_cancel: cancel,
                no_probe: ctx.config.no_probe,
            };
            let outcome = load_driver_from_media(&mut ctx, request)?;
            info!("Media acquisition finished: {:?}", outcome);
        }
        Commands::Source { source } => load_from_source(&mut ctx, &source)?,
        Commands::Device { device } => {
            let disk = load_from_device(&mut ctx, &device)?;
            info!("Loaded driver disk #{}: {}", disk.sequence, disk.title);
        }
        Commands::Partition { device } => {
            let load = load_from_partition(&mut ctx, &device)?;
            info!("Partition {}: {:?}", device, load);
            return Ok(load.code().unsigned_abs() as u8);
        }
        Commands::Auto => {
            let loaded = load_labelled_disks(&mut ctx, interactive)?;
            info!("{} labelled driver disk(s) loaded", loaded);
        }
        Commands::Kickstart { file } => {
            let disks = KickstartDriverDisk::parse_file(&file)?;
            load_kickstart_disks(&mut ctx, &disks)?;
        }
        Commands::Boot { cmdline } => {
            let options = BootOptions::from_file(&cmdline)?;
            info!("Boot options: {:?}", options);
            boot_sequence(&mut ctx, &options, interactive)?;
        }
        Commands::Verify { .. } | Commands::Extract { .. } | Commands::Inspect { .. } => {}
    }

    Ok(0)
}

fn verify_dir(config: &LoaderConfig, dir: &Path) -> Result<u8> {
    let product = config.product();
    let descriptor = Verifier::from_config(config, &product).verify(dir)?;
    println!("✓ {}: {}", dir.display(), descriptor.title());
    Ok(0)
}

fn extract_dir(dir: &Path, dest: &Path, kernel: &str) -> Result<u8> {
    let report = extract_packages_from(dir, dest, kernel)?;
    println!(
        "{} file(s) from {} of {} package(s) for kernel {}",
        report.extracted_files(),
        report.extracted_packages(),
        report.outcomes.len(),
        kernel
    );
    Ok(if report.is_success() { 0 } else { 1 })
}

fn inspect_package(package: &Path) -> Result<u8> {
    let reader = PackageReader::open(package)?;
    let header = reader.header();

    println!("Name:    {}", header.name().unwrap_or("(none)"));
    println!("Version: {}", header.version().unwrap_or("(none)"));
    println!("Release: {}", header.release().unwrap_or("(none)"));
    println!("Arch:    {}", header.arch().unwrap_or("(none)"));
    match header.payload_compression() {
        Ok(compression) => println!("Payload: {}", compression),
        Err(e) => println!("Payload: {}", e),
    }
    println!("Provides:");
    for capability in header.provides() {
        println!("  {}", capability);
    }
    println!("Requires:");
    for capability in header.requires() {
        println!("  {}", capability);
    }
    Ok(0)
}
