//! Firmware upload through the board's I2C bootloader.
//!
//! Sequence on the wire (bootloader at [`BOOT_ADDR`]):
//!
//! 1. Reset pulse on the reset line
//! 2. `DE AD BE EF <blocks> <crc> <crc>`, then `AA BB` is read back
//! 3. Every 64 byte block of the image, padded with `0xFF`
//! 4. `AA BB` is read back once the bootloader verified the CRC, then the
//!    board is reset again into the new application
//!
//! The bootloader can not report anything richer than the two acknowledge
//! bytes, so a refusal at step 2 or 4 is returned as `Ok(false)`. Nothing is
//! retried. After a failed upload the board is in an undefined boot state and
//! only a fresh [`Bootloader::upload`] recovers it.

use crc::{Crc, CRC_8_SMBUS};
use embedded_hal::{delay::DelayNs, digital::OutputPin, i2c::I2c};

use crate::error::{bus_error, pin_error, Error, Result};

/// 7-bit address of the bootloader
pub const BOOT_ADDR: u8 = 0x22;
pub const BLOCK_SIZE: usize = 64;
/// Padding for the last block
pub const FILL_BYTE: u8 = 0xFF;
pub const MAX_BLOCKS: usize = u8::MAX as usize;
pub const BOOT_MAGIC: [u8; 4] = [0xDE, 0xAD, 0xBE, 0xEF];
pub const BOOT_ACK: [u8; 2] = [0xAA, 0xBB];
pub const PREAMBLE_LEN: usize = BOOT_MAGIC.len() + 3;

static_assertions::const_assert_eq!(PREAMBLE_LEN, 7);

// Reset timing of the board, not configurable
const RESET_ACTIVE_MS: u32 = 100;
const RESET_RELEASE_MS: u32 = 300;
const RESET_SETTLE_MS: u32 = 15;
/// Time the bootloader needs before the acknowledge can be read
const ACK_WAIT_MS: u32 = 10;
/// Time the bootloader needs to program one block
const BLOCK_PACE_MS: u32 = 50;

/// CRC-8, poly 0x07, init 0, no reflection, no final xor
const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

pub const fn block_count(len: usize) -> usize {
    len.div_ceil(BLOCK_SIZE)
}

fn padded_blocks(data: &[u8]) -> impl Iterator<Item = [u8; BLOCK_SIZE]> + '_ {
    data.chunks(BLOCK_SIZE).map(|chunk| {
        let mut block = [FILL_BYTE; BLOCK_SIZE];
        block[..chunk.len()].copy_from_slice(chunk);
        block
    })
}

/// Checksum the bootloader verifies: CRC-8 over every block of the image,
/// the last one padded with [`FILL_BYTE`].
pub fn compute_checksum(data: &[u8]) -> u8 {
    let mut digest = CRC8.digest();
    for block in padded_blocks(data) {
        digest.update(&block);
    }
    digest.finalize()
}

/// A raw firmware image. There is no header, block count and checksum are
/// derived from the bytes.
#[derive(Debug, Clone, Copy)]
pub struct FirmwareImage<'a> {
    data: &'a [u8],
}

impl<'a> FirmwareImage<'a> {
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub const fn len(&self) -> usize {
        self.data.len()
    }

    pub const fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub const fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    pub const fn block_count(&self) -> usize {
        block_count(self.data.len())
    }

    /// Blocks as they go on the wire
    pub fn blocks(&self) -> impl Iterator<Item = [u8; BLOCK_SIZE]> + 'a {
        padded_blocks(self.data)
    }

    pub fn checksum(&self) -> u8 {
        compute_checksum(self.data)
    }
}

/// Bootloader activation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    pub blocks: u8,
    pub checksum: u8,
}

impl Preamble {
    pub fn for_image(image: &FirmwareImage<'_>) -> Result<Self> {
        let blocks = u8::try_from(image.block_count())
            .map_err(|_| Error::ImageTooLarge { len: image.len() })?;
        Ok(Self {
            blocks,
            checksum: image.checksum(),
        })
    }

    pub fn to_bytes(&self) -> [u8; PREAMBLE_LEN] {
        let mut req = [0; PREAMBLE_LEN];
        req[..BOOT_MAGIC.len()].copy_from_slice(&BOOT_MAGIC);
        req[4] = self.blocks;
        req[5] = self.checksum;
        req[6] = self.checksum;
        req
    }
}

/// Electrical level that holds the board in reset
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ResetPolarity {
    /// Reset line is inverted on the VPi carrier
    #[default]
    ActiveLow,
    ActiveHigh,
}

pub struct Bootloader<I2C, RST, D> {
    i2c: I2C,
    reset: RST,
    delay: D,
    polarity: ResetPolarity,
}

impl<I2C, RST, D> Bootloader<I2C, RST, D>
where
    I2C: I2c,
    RST: OutputPin,
    D: DelayNs,
{
    pub fn new(i2c: I2C, reset: RST, delay: D) -> Self {
        Self {
            i2c,
            reset,
            delay,
            polarity: ResetPolarity::default(),
        }
    }

    pub fn with_polarity(mut self, polarity: ResetPolarity) -> Self {
        self.polarity = polarity;
        self
    }

    pub fn release(self) -> (I2C, RST, D) {
        (self.i2c, self.reset, self.delay)
    }

    fn drive_reset(&mut self, active: bool) -> Result<()> {
        let high = match self.polarity {
            ResetPolarity::ActiveHigh => active,
            ResetPolarity::ActiveLow => !active,
        };
        let res = if high {
            self.reset.set_high()
        } else {
            self.reset.set_low()
        };
        res.map_err(pin_error)
    }

    /// Reset pulse: active 100ms, inactive 300ms, then active again for 15ms
    pub fn reset_assert(&mut self) -> Result<()> {
        log::debug!("Resetting board");
        self.drive_reset(true)?;
        self.delay.delay_ms(RESET_ACTIVE_MS);
        self.drive_reset(false)?;
        self.delay.delay_ms(RESET_RELEASE_MS);
        self.drive_reset(true)?;
        self.delay.delay_ms(RESET_SETTLE_MS);
        Ok(())
    }

    fn read_ack(&mut self) -> Result<bool> {
        self.delay.delay_ms(ACK_WAIT_MS);
        let mut resp = [0; BOOT_ACK.len()];
        self.i2c.read(BOOT_ADDR, &mut resp).map_err(bus_error)?;
        log::trace!("Bootloader answered {resp:02X?}");
        Ok(resp == BOOT_ACK)
    }

    /// Resets the board and requests the bootloader for `image`.
    /// Returns `false` if the bootloader did not acknowledge.
    pub fn enter_bootloader(&mut self, image: &FirmwareImage<'_>) -> Result<bool> {
        let preamble = Preamble::for_image(image)?;
        self.enter(&preamble)
    }

    /// Same as [`Self::enter_bootloader`] with an already computed preamble
    pub fn enter(&mut self, preamble: &Preamble) -> Result<bool> {
        self.reset_assert()?;
        let req = preamble.to_bytes();
        log::debug!(
            "Requesting bootloader: blocks={}, CRC={:02X}",
            preamble.blocks,
            preamble.checksum
        );
        self.i2c.write(BOOT_ADDR, &req).map_err(bus_error)?;
        let acked = self.read_ack()?;
        if !acked {
            log::warn!("Bootloader did not acknowledge activation");
        }
        Ok(acked)
    }

    /// Sends every block of `image`. Only valid after a successful
    /// [`Self::enter`]. `on_block` gets `(sent, total)` after each block.
    pub fn transfer<F>(&mut self, image: &FirmwareImage<'_>, mut on_block: F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        let total = image.block_count();
        for (idx, block) in image.blocks().enumerate() {
            log::trace!("Block {}/{}", idx + 1, total);
            self.i2c.write(BOOT_ADDR, &block).map_err(bus_error)?;
            // I2C is faster than the flash, give it time to program the block
            self.delay.delay_ms(BLOCK_PACE_MS);
            on_block(idx + 1, total);
        }
        Ok(())
    }

    /// Reads the final acknowledge and resets the board into the new
    /// application. The reset happens whatever the answer was.
    pub fn finish(&mut self) -> Result<bool> {
        let acked = self.read_ack()?;
        self.reset_assert()?;
        if acked {
            log::debug!("Upload confirmed");
        } else {
            log::warn!("Bootloader rejected the image");
        }
        Ok(acked)
    }

    pub fn upload(&mut self, image: &FirmwareImage<'_>) -> Result<bool> {
        self.upload_with(image, |_, _| {})
    }

    /// [`Self::upload`] reporting progress after every block
    pub fn upload_with<F>(&mut self, image: &FirmwareImage<'_>, on_block: F) -> Result<bool>
    where
        F: FnMut(usize, usize),
    {
        let preamble = Preamble::for_image(image)?;
        if !self.enter(&preamble)? {
            return Ok(false);
        }
        self.transfer(image, on_block)?;
        self.finish()
    }
}
