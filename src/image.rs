// SPDX-FileCopyrightText: 2024 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! Construction of bootloader-compatible images.
//!
//! The bootloader only jumps to an application whose image ends with an 8 byte trailer:
//!  - 4 bytes of CRC over every preceding byte (big endian)
//!  - 4 bytes of the magic word [`MAGIC`] (big endian)
//!
//! The bootloader scans for the magic word to find the end of the image, then compares the CRC it
//! computes over the application with the one stored in the trailer.

use crate::error::{Error, Result};

use byteorder::BigEndian;
use byteorder::ByteOrder;
use byteorder::WriteBytesExt;
use crc::{Algorithm, Crc};
use log::{debug, info, warn};

use std::fs;
use std::fs::File;
use std::io;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

/// The word the bootloader looks for to locate the trailer.
pub const MAGIC: u32 = 0x1BAD_CAFE;

/// Size of the trailer appended to every image, in bytes.
pub const TRAILER_SIZE: usize = 8;

/// Suffix that replaces the extension of the source binary.
pub const PATCHED_EXTENSION: &str = "crc.bin";

/// The CRC used by the bootloader's validator.
///
/// This is the Castagnoli polynomial, but without the usual initial value and final XOR, so none
/// of the catalog algorithms match it.
pub const CRC_ALGORITHM: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x1EDC_6F41,
    init: 0x0000_0000,
    refin: true,
    refout: true,
    xorout: 0x0000_0000,
    check: 0x58E3_FA20,
    residue: 0x0000_0000,
};

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_ALGORITHM);

/// Computes the bootloader CRC over `data`.
pub fn checksum(data: &[u8]) -> u32 {
    CRC.checksum(data)
}

/// Returns the path the patched image for `source` is written to.
///
/// Only the last extension is replaced, so `a.b.bin` becomes `a.b.crc.bin`. A path without an
/// extension has the suffix appended, so `firmware` becomes `firmware.crc.bin`.
pub fn patched_path(source: &Path) -> PathBuf {
    source.with_extension(PATCHED_EXTENSION)
}

/// The trailer appended to an application image.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Trailer {
    /// CRC of every byte preceding the trailer.
    pub checksum: u32,
    /// Should always be [`MAGIC`].
    pub magic: u32,
}

impl Trailer {
    /// Creates a trailer for an application with the given checksum.
    pub fn new(checksum: u32) -> Self {
        Self {
            checksum,
            magic: MAGIC,
        }
    }

    /// Creates the trailer covering `data`.
    pub fn for_data(data: &[u8]) -> Self {
        Self::new(checksum(data))
    }

    /// Encodes the trailer in network byte order.
    pub fn to_bytes(self) -> [u8; TRAILER_SIZE] {
        let mut bytes = [0u8; TRAILER_SIZE];
        BigEndian::write_u32(&mut bytes[..4], self.checksum);
        BigEndian::write_u32(&mut bytes[4..], self.magic);
        bytes
    }

    /// Writes the encoded trailer to `writer`.
    ///
    /// # Errors
    ///
    /// Any error returned by the writer.
    pub fn write_to(self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_u32::<BigEndian>(self.checksum)?;
        writer.write_u32::<BigEndian>(self.magic)
    }

    /// Splits an image into the application and its trailer.
    ///
    /// # Errors
    ///
    /// [Error::InvalidImage] if the image is too short to hold a trailer.
    pub fn parse(image: &[u8]) -> Result<(&[u8], Self)> {
        if image.len() < TRAILER_SIZE {
            return Err(Error::InvalidImage(format!(
                "{} bytes is too short to hold a trailer",
                image.len()
            )));
        }
        let (data, trailer) = image.split_at(image.len() - TRAILER_SIZE);
        let trailer = Self {
            checksum: BigEndian::read_u32(&trailer[..4]),
            magic: BigEndian::read_u32(&trailer[4..]),
        };
        Ok((data, trailer))
    }

    /// Checks the trailer against the application it was attached to.
    ///
    /// # Errors
    ///
    /// [Error::InvalidImage] if the magic word is wrong or the CRC doesn't match the data.
    pub fn validate(&self, data: &[u8]) -> Result<()> {
        if self.magic != MAGIC {
            return Err(Error::InvalidImage(format!(
                "expected magic 0x{MAGIC:08X}, found 0x{:08X}",
                self.magic
            )));
        }
        let expected = checksum(data);
        if self.checksum != expected {
            return Err(Error::InvalidImage(format!(
                "stored CRC 0x{:08X} does not match computed 0x{expected:08X}",
                self.checksum
            )));
        }
        Ok(())
    }
}

/// Checks a complete image the same way the bootloader does, returning the application bytes.
///
/// # Errors
///
/// [Error::InvalidImage] if the trailer is missing or doesn't match.
pub fn verify_patched_image(image: &[u8]) -> Result<&[u8]> {
    let (data, trailer) = Trailer::parse(image)?;
    trailer.validate(data)?;
    Ok(data)
}

/// A patched image on disk. The file is deleted when this is dropped.
#[derive(Debug)]
pub struct PatchedImage {
    path: PathBuf,
    trailer: Trailer,
}

impl PatchedImage {
    /// Location of the patched image.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The trailer that was appended to the source binary.
    pub fn trailer(&self) -> Trailer {
        self.trailer
    }
}

impl Drop for PatchedImage {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed {}", self.path.display()),
            Err(error) => warn!("Unable to remove {}: {error}", self.path.display()),
        }
    }
}

/// Writes a copy of `source` with the bootloader trailer appended, next to the source.
///
/// The source binary is left untouched. The returned guard removes the new file once dropped; if
/// writing fails part way, the partial file is removed before returning.
///
/// # Errors
///
/// [Error::FileAccess] if the source can't be read or the patched image can't be written.
pub fn build_patched_image(source: &Path) -> Result<PatchedImage> {
    info!("Building image from {}", source.display());

    let data = fs::read(source).map_err(Error::file_access(source))?;
    let trailer = Trailer::for_data(&data);
    debug!(
        "Read {} bytes, CRC: 0x{:08X}, trailer: {:02X?}",
        data.len(),
        trailer.checksum,
        trailer.to_bytes()
    );

    let path = patched_path(source);
    let file = File::create(&path).map_err(Error::file_access(&path))?;
    let image = PatchedImage { path, trailer };

    write_image(BufWriter::new(file), &data, trailer).map_err(Error::file_access(&image.path))?;

    info!(
        "Wrote {} bytes to {}",
        data.len() + TRAILER_SIZE,
        image.path.display()
    );
    Ok(image)
}

fn write_image(mut writer: impl Write, data: &[u8], trailer: Trailer) -> io::Result<()> {
    writer.write_all(data)?;
    trailer.write_to(&mut writer)?;
    writer.flush()
}
