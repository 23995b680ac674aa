// SPDX-License-Identifier: GPL-3.0-only

use anyhow::{Context, Result};
use clap_lex::RawArgs;
use cosmic_xrandr::{
    backend::{x11::X11Backend, RandrBackend},
    config::Config,
    display::Display,
    logger,
};
use std::{path::PathBuf, process};
use tracing::{error, info, warn};

#[derive(Debug, Default)]
struct Args {
    list: bool,
    save: bool,
    config: Option<PathBuf>,
    display: Option<String>,
}

fn main() {
    if let Err(err) = main_inner() {
        error!("Error occured in main(): {:?}", err);
        eprintln!("cosmic-xrandr: {:#}", err);
        process::exit(1);
    }
}

fn main_inner() -> Result<()> {
    let raw_args = RawArgs::from_args();
    let mut cursor = raw_args.cursor();
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    let mut args = Args::default();

    // Parse the arguments
    while let Some(arg) = raw_args.next_os(&mut cursor) {
        match arg.to_str() {
            Some("--help") | Some("-h") => {
                print_help(env!("CARGO_PKG_VERSION"), git_hash);
                return Ok(());
            }
            Some("--version") | Some("-V") => {
                println!(
                    "cosmic-xrandr {} (git commit {})",
                    env!("CARGO_PKG_VERSION"),
                    git_hash
                );
                return Ok(());
            }
            Some("--list") | Some("-l") => args.list = true,
            Some("--save") | Some("-s") => args.save = true,
            Some("--config") | Some("-c") => {
                let path = raw_args
                    .next_os(&mut cursor)
                    .context("--config expects a path")?;
                args.config = Some(PathBuf::from(path));
            }
            Some("--display") | Some("-d") => {
                let name = raw_args
                    .next_os(&mut cursor)
                    .and_then(|name| name.to_str())
                    .context("--display expects a display name")?;
                args.display = Some(name.to_string());
            }
            _ => {
                print_help(env!("CARGO_PKG_VERSION"), git_hash);
                anyhow::bail!("unknown argument {:?}", arg);
            }
        }
    }

    // setup logger
    logger::init_logger()?;

    let backend = X11Backend::connect(args.display.as_deref())
        .with_context(|| "Failed to connect to the X server")?;
    let mut display = Display::new(backend).with_context(|| "Failed to enumerate outputs")?;

    if args.list {
        list_outputs(&display)?;
        return Ok(());
    }

    let mut config = Config::load(args.config);
    if args.save {
        config.write_outputs(&display)?;
        info!("Stored the current output setup");
        return Ok(());
    }

    if !config.read_outputs(&mut display)? {
        return Ok(());
    }
    let report = display.apply_changed()?;
    for mismatch in &report.mismatches {
        warn!(
            "Output {} ended up at {} instead of {}",
            mismatch.output, mismatch.actual, mismatch.expected
        );
    }
    for (output, err) in &report.failures {
        warn!(?err, "Output {} was only partially configured", output);
    }
    info!(
        committed = report.committed.len(),
        reopened = report.reopened.len(),
        "Screen is now {}x{}",
        report.screen_size.0,
        report.screen_size.1,
    );

    Ok(())
}

fn list_outputs<B: RandrBackend>(display: &Display<B>) -> Result<()> {
    let (width, height) = display.screen_size();
    println!("Screen: {}x{}", width, height);
    for output in display.outputs() {
        if output.is_opened() {
            println!(
                "{} {} rotation {:?}",
                output.name(),
                output.allocation(),
                output.rotation()
            );
        } else {
            println!("{} disabled", output.name());
        }
        for mode in display.modes(output.id())? {
            let marker = if mode.id == output.current_mode() {
                "*"
            } else {
                " "
            };
            println!(
                "  {}{}x{} @ {}.{:03} Hz",
                marker,
                mode.width,
                mode.height,
                mode.refresh / 1000,
                mode.refresh % 1000
            );
        }
    }
    Ok(())
}

fn print_help(version: &str, git_rev: &str) {
    println!(
        r#"cosmic-xrandr {version} (git commit {git_rev})
System76 <info@system76.com>

Restores the stored output layout of the connected monitors on an X screen.

Options:
  -h, --help            Show this message
  -V, --version         Show the version of cosmic-xrandr
  -l, --list            List connected outputs and their modes
  -s, --save            Store the current layout for the connected outputs
  -c, --config <PATH>   Use PATH instead of the default outputs.ron
  -d, --display <NAME>  Connect to NAME instead of $DISPLAY"#
    );
}
