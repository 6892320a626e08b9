//! stm32sprog - Command-line programmer for the STM32 UART bootloader.
//!
//! One-shot tool: any combination of erase (`-e`), write (`-w FILE`),
//! verify (`-v`), and run (`-r`) is performed in that order against the
//! bootloader on the given serial device, then the tool exits.

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use console::style;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::debug;

use stm32sprog::{read_firmware, FirmwareFormat, NativePort, Programmer, SerialConfig};

/// stm32sprog - program STM32 microcontrollers over the UART bootloader.
///
/// The chip must be booted into its factory bootloader (BOOT0 high, or a
/// board reset circuit wired to DTR). At least one of -e, -r, -w must be
/// given.
#[derive(Debug, Parser)]
#[command(name = "stm32sprog", version)]
struct Cli {
    /// Set the baud rate.
    #[arg(short = 'b', value_name = "BAUD", default_value_t = 115_200)]
    baud: u32,

    /// Communicate using DEVICE.
    #[arg(short = 'd', value_name = "DEVICE", default_value = "/dev/ttyUSB0")]
    device: String,

    /// Erase the target device.
    #[arg(short = 'e')]
    erase: bool,

    /// Run the firmware on the device.
    #[arg(short = 'r')]
    run: bool,

    /// Verify the write process.
    #[arg(short = 'v', requires = "write")]
    verify: bool,

    /// Write the raw binary FILE to the target device.
    #[arg(short = 'w', value_name = "FILE")]
    write: Option<PathBuf>,
}

fn main() {
    let cli = parse_args();

    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();
    debug!("stm32sprog v{}", env!("CARGO_PKG_VERSION"));

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("error:").red().bold());
        process::exit(1);
    }
}

/// Parse the command line, enforcing the rules clap cannot express.
///
/// Argument errors print usage to stderr and exit 1 (not clap's default 2).
fn parse_args() -> Cli {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err)
            if matches!(
                err.kind(),
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
            ) =>
        {
            print!("{err}");
            process::exit(0);
        }
        Err(err) => {
            eprint!("{err}");
            process::exit(1);
        }
    };

    if !(cli.erase || cli.run || cli.write.is_some()) {
        eprintln!("No actions specified.");
        eprintln!("{}", Cli::command().render_usage());
        process::exit(1);
    }

    cli
}

/// Execute the requested action sequence.
fn run(cli: &Cli) -> Result<()> {
    let config = SerialConfig::new(cli.device.as_str(), cli.baud);
    let port = NativePort::open(&config)
        .with_context(|| format!("opening serial device {}", cli.device))?;

    let mut programmer = Programmer::new(port);
    programmer.connect()?;
    programmer.identify()?;

    let (major, minor) = programmer.params().version();
    let flash_begin = programmer.params().flash_begin;
    eprintln!("Bootloader version {major}.{minor} detected.");

    let mut image = None;
    if let Some(path) = &cli.write {
        let (mut img, format) = read_firmware(path)?;
        if format == FirmwareFormat::Raw {
            img.shift(i64::from(flash_begin))?;
        }
        image = Some(img);
    }

    if cli.erase {
        eprintln!("Erasing:");
        let bar = progress_bar(100);
        programmer.erase_all(&mut |done, _| bar.set_position(done))?;
        bar.finish();
    } else if let Some(img) = &image {
        eprintln!("Erasing...");
        programmer.erase_image(img)?;
    }

    if let Some(img) = &mut image {
        eprintln!("Writing:");
        let bar = progress_bar(img.total_size());
        programmer.write_image(img, &mut |done, _| bar.set_position(done))?;
        bar.finish();

        if cli.verify {
            eprintln!("Verifying:");
            let bar = progress_bar(img.total_size());
            programmer.verify_image(img, &mut |done, _| bar.set_position(done))?;
            bar.finish();
        }
    }

    if cli.run {
        programmer.go(flash_begin)?;
        eprintln!("Firmware started.");
    }

    Ok(())
}

/// Progress bar on stderr, hidden when stderr is not a terminal.
fn progress_bar(len: u64) -> ProgressBar {
    if !console::Term::stderr().is_term() {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len);
    #[allow(clippy::unwrap_used)] // Static template string
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{percent:>3}%[{bar:70}]")
            .unwrap()
            .progress_chars("== "),
    );
    bar.set_draw_target(ProgressDrawTarget::stderr());
    bar
}
