use anyhow::{bail, Context, Result};
use clap::Parser;
use log::LevelFilter;
use std::io::Write;
use std::ops::Range;
use std::path::PathBuf;

mod file_ops;

use file_ops::{read_firmware, FileFormat};
use twiboot_bridge::config::{ActivationCommand, Config, LEGACY_ACTIVATION_BYTE};
use twiboot_bridge::{Activator, Bootloader, LinuxI2c, Programmer, StdDelay};

#[derive(Parser)]
#[command(name = "twiboot-bridge")]
#[command(about = "Flashes AVR targets running twiboot over I2C")]
#[command(version)]
struct Cli {
    /// I2C bus number (e.g., 1 for /dev/i2c-1)
    bus: u8,

    /// Firmware file to flash (optional - if not provided, shows bootloader info)
    #[arg(value_name = "FILE")]
    file: Option<PathBuf>,

    /// Bootloader I2C address (0x01-0x7F)
    #[arg(short = 'b', long = "bootloader", value_parser = parse_address, default_value = "0x29")]
    bootloader_address: u8,

    /// Application I2C address, used to request bootloader mode
    #[arg(short = 'a', long = "app", value_parser = parse_address, default_value = "0x30")]
    app_address: u8,

    /// Ask the running application to reboot into the bootloader first
    #[arg(long)]
    activate: bool,

    /// Send the single byte 0x42 instead of the register/magic pair
    #[arg(long = "legacy-activation", requires = "activate")]
    legacy_activation: bool,

    /// Disable verify after write
    #[arg(short = 'n', long = "no-verify")]
    no_verify: bool,

    /// Stay in the bootloader after flashing
    #[arg(long = "no-start")]
    no_start: bool,

    /// Flash page size in bytes
    #[arg(long = "page-size", default_value_t = 128)]
    page_size: usize,

    /// Flash range that is never written, e.g. 0x7C00-0x8000
    #[arg(long, value_parser = parse_range, default_value = "0x7C00-0x8000")]
    reserved: Range<u32>,
}

fn parse_number(s: &str) -> Result<u32, String> {
    if let Some(hex_str) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex_str, 16).map_err(|_| format!("Invalid hex number: {}", s))
    } else {
        s.parse::<u32>().map_err(|_| format!("Invalid number: {}", s))
    }
}

fn parse_address(s: &str) -> Result<u8, String> {
    let address = parse_number(s)?;
    match u8::try_from(address) {
        Ok(a) if (0x01..=0x7F).contains(&a) => Ok(a),
        _ => Err(format!("I2C address must be between 0x01 and 0x7F: {}", s)),
    }
}

fn parse_range(s: &str) -> Result<Range<u32>, String> {
    let (start, end) = s
        .split_once('-')
        .ok_or_else(|| format!("Expected START-END: {}", s))?;
    let range = parse_number(start.trim())?..parse_number(end.trim())?;
    if range.start > range.end {
        return Err(format!("Range start is above its end: {}", s));
    }
    Ok(range)
}

fn init_logging() {
    let mut builder = pretty_env_logger::formatted_builder();
    match std::env::var("RUST_LOG") {
        Ok(filters) => builder.parse_filters(&filters),
        Err(_) => builder.filter_level(LevelFilter::Info),
    };
    builder.init();
}

/// Progress line on stdout, redrawn in place.
fn show_progress(label: &'static str) -> impl FnMut(u8) {
    let mut last = None;
    move |percent| {
        if last == Some(percent) {
            return;
        }
        last = Some(percent);
        print!("\r{}: {:3}%", label, percent);
        if percent == 100 {
            println!();
        }
        let _ = std::io::stdout().flush();
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let config = Config {
        bootloader_address: cli.bootloader_address,
        app_address: cli.app_address,
        activation: if cli.legacy_activation {
            ActivationCommand::MagicByte(LEGACY_ACTIVATION_BYTE)
        } else {
            ActivationCommand::default()
        },
        page_size: cli.page_size,
        reserved: cli.reserved.clone(),
        ..Config::default()
    };
    if let Err(e) = config.validate() {
        bail!("Invalid configuration: {}", e);
    }

    // Create device path from bus number
    let device_path = format!("/dev/i2c-{}", cli.bus);
    let i2c = LinuxI2c::new(&device_path, config.bootloader_address)
        .with_context(|| format!("Failed to open {}", device_path))?;
    let mut bootloader = Bootloader::new(i2c, StdDelay, config);

    if cli.activate {
        let info = Activator::new(&mut bootloader)
            .activate()
            .context("Failed to activate the bootloader")?;
        println!("Version: {}", info);
    } else {
        let version = bootloader
            .read_version()
            .context("Bootloader did not answer the version query")?;
        println!("Version: {}", version);
    }

    println!("Device: I2C address 0x{:02X}", cli.bootloader_address);
    let signature = bootloader
        .read_signature()
        .context("Failed to read chip signature")?;
    println!("Chip signature: {}", signature);

    // If no file specified, just show info and exit
    let Some(filepath) = &cli.file else {
        return Ok(());
    };
    if !filepath.exists() {
        bail!("File not found: {}", filepath.display());
    }

    let firmware = read_firmware(filepath, FileFormat::from_extension(filepath))?;
    println!("Writing flash from {}", filepath.display());

    let mut programmer = Programmer::new(&mut bootloader).with_expected_size(firmware.data_len());
    let written = programmer.upload(firmware.records(), show_progress("Writing"));
    let report = programmer.last_report().clone();
    if let Err(e) = written {
        // Hand control back to whatever is in flash before giving up
        if let Err(leave) = bootloader.leave_bootloader() {
            log::warn!("could not leave the bootloader: {}", leave);
        }
        return Err(e).context("Flash write failed");
    }
    println!("Wrote {}", report);

    if !cli.no_verify {
        println!("Verifying flash...");
        let mut programmer =
            Programmer::new(&mut bootloader).with_expected_size(firmware.data_len());
        let checked = programmer
            .verify(firmware.records(), show_progress("Verifying"))
            .context("Flash verify failed")?;
        println!("Verified {} bytes", checked);
    }

    // Disconnect (switch to application)
    if !cli.no_start {
        bootloader
            .leave_bootloader()
            .context("Failed to start the application")?;
        println!("Application started");
    }

    Ok(())
}
