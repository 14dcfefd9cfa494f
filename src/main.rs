// SPDX-FileCopyrightText: 2024 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! # flash
//!
//! This CLI appends the bootloader's CRC trailer to an application binary and flashes the result
//! through a Segger J-Link, by handing a generated script to J-Link Commander.
//!
//! The exit status is the Commander's own, or a distinct non-zero status if the Commander never
//! ran.

use jlink_flash::session::{DEFAULT_ADDRESS, DEFAULT_DEVICE, DEFAULT_SPEED, DEFAULT_TOOL};
use jlink_flash::{run_flash_session, FlashParameters};

use clap::Parser;
use log::{error, info};

use std::ffi::OsString;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(author, version, about, long_about=None)]
struct Cli {
    #[arg(short, long, default_value_t = DEFAULT_SPEED)]
    /// The interface clock speed to operate at, in kHz.
    speed: u32,
    #[arg(short, long, default_value = DEFAULT_DEVICE)]
    /// The device type being talked to.
    device: String,
    #[arg(short, long, default_value = DEFAULT_TOOL)]
    /// The J-Link Commander executable.
    jlink: OsString,
    /// The binary file to flash.
    binary: PathBuf,
    #[arg(default_value = DEFAULT_ADDRESS)]
    /// The address to flash the binary to, as understood by J-Link Commander.
    address: String,
    #[command(flatten)]
    /// The level of output verbosity.
    verbose: clap_verbosity_flag::Verbosity,
}

impl Cli {
    fn params(&self) -> FlashParameters {
        FlashParameters {
            device: self.device.clone(),
            speed: self.speed,
            address: self.address.clone(),
            tool: self.jlink.clone(),
            ..FlashParameters::new(&self.binary)
        }
    }
}

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.verbose.log_level_filter())
        .init();

    info!(
        "Script version: {}.{}",
        env!("CARGO_PKG_VERSION_MAJOR"),
        env!("CARGO_PKG_VERSION_MINOR")
    );

    if let Err(error) = run_flash_session(&cli.params()) {
        error!("{error}");
        process::exit(error.exit_code());
    }
}
