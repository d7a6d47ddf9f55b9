use embedded_hal::{digital, i2c};

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Failures of the host side. Protocol level refusals from the bootloader
/// are not errors, they are reported as `Ok(false)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("I2C transfer failed: {0:?}")]
    Bus(i2c::ErrorKind),
    #[error("Reset line could not be driven: {0:?}")]
    ResetLine(digital::ErrorKind),
    /// The block count travels in a single byte
    #[error("Firmware image of {len} bytes needs more than 255 blocks")]
    ImageTooLarge { len: usize },
    #[error("Register payload of {len} bytes is too long")]
    PayloadTooLong { len: usize },
}

pub(crate) fn bus_error<E: i2c::Error>(err: E) -> Error {
    log::error!("I2C error: {err:?}");
    Error::Bus(err.kind())
}

pub(crate) fn pin_error<E: digital::Error>(err: E) -> Error {
    log::error!("Reset pin error: {err:?}");
    Error::ResetLine(err.kind())
}
