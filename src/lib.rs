// SPDX-FileCopyrightText: 2024 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! This crate prepares application binaries for a CRC-validating bootloader, and flashes them
//! with Segger's J-Link Commander.
//!
//! The bootloader only boots images that end with a trailer holding a CRC of the application and
//! a magic word, see [`image`]. [`session`] builds such an image, generates a Commander script to
//! load it, and runs the Commander, cleaning up after itself.
//!
//! A binary companion crate, `flash`, is provided as the command line front end.

pub mod error;
pub mod image;
pub mod session;

pub use error::{Error, Result};
pub use image::{build_patched_image, PatchedImage, Trailer};
pub use session::{run_flash_session, FlashParameters};
