use std::{
    collections::{btree_map::Entry, BTreeMap},
    fmt, io,
    path::PathBuf,
    thread::sleep,
    time::Duration,
};

use color_eyre::eyre::{Report, WrapErr};
use embedded_hal::{
    delay::DelayNs,
    digital::{self, OutputPin},
    i2c::{self, I2c, NoAcknowledgeSource, Operation, SevenBitAddress},
};
use i2cdev::{
    core::I2CDevice,
    linux::{LinuxI2CDevice, LinuxI2CError},
};
use sysfs_gpio::{Direction, Pin};
use vpi_common::{bootload::BOOT_ADDR, regs::VPI_ADDR, Bootloader, ResetPolarity, Vpi};

/// Where the board is wired on this host
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub bus: PathBuf,
    pub reset_pin: u64,
    pub reset_polarity: ResetPolarity,
}

impl BusConfig {
    pub fn bootloader(&self) -> Result<Bootloader<LinuxI2c, ResetPin, StdDelay>, Report> {
        let reset = ResetPin::export(self.reset_pin).map_err(|e| {
            Report::msg(format!(
                "Could not drive reset GPIO {} ({e}), check wiring and permissions",
                self.reset_pin
            ))
        })?;
        let i2c = self.open(BOOT_ADDR)?;
        Ok(Bootloader::new(i2c, reset, StdDelay).with_polarity(self.reset_polarity))
    }

    pub fn vpi(&self) -> Result<Vpi<LinuxI2c, StdDelay>, Report> {
        Ok(Vpi::connect(self.open(VPI_ADDR)?, StdDelay)?)
    }

    /// Opens the bus up front so a missing adapter is reported with its cause
    fn open(&self, address: u8) -> Result<LinuxI2c, Report> {
        let mut i2c = LinuxI2c::new(self.bus.clone());
        i2c.device(address)
            .wrap_err_with(|| format!("Could not open {:?}", self.bus))?;
        Ok(i2c)
    }
}

// errno values of the Linux I2C stack, see Documentation/i2c/fault-codes
const EAGAIN: i32 = 11;
const ENXIO: i32 = 6;
const EREMOTEIO: i32 = 121;

#[derive(Debug)]
pub struct BusError(io::Error);

impl From<io::Error> for BusError {
    fn from(err: io::Error) -> Self {
        Self(err)
    }
}

impl From<LinuxI2CError> for BusError {
    fn from(err: LinuxI2CError) -> Self {
        Self(err.into())
    }
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for BusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl i2c::Error for BusError {
    fn kind(&self) -> i2c::ErrorKind {
        match self.0.raw_os_error() {
            Some(ENXIO | EREMOTEIO) => i2c::ErrorKind::NoAcknowledge(NoAcknowledgeSource::Unknown),
            Some(EAGAIN) => i2c::ErrorKind::ArbitrationLoss,
            _ => i2c::ErrorKind::Other,
        }
    }
}

/// `/dev/i2c-N` adapter. i2cdev binds a handle to one slave address, the
/// bootloader and the application live on different ones, so handles are
/// opened on first use and kept.
pub struct LinuxI2c {
    path: PathBuf,
    devices: BTreeMap<u8, LinuxI2CDevice>,
}

impl LinuxI2c {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            devices: BTreeMap::new(),
        }
    }

    fn device(&mut self, address: u8) -> Result<&mut LinuxI2CDevice, BusError> {
        match self.devices.entry(address) {
            Entry::Occupied(dev) => Ok(dev.into_mut()),
            Entry::Vacant(slot) => {
                log::debug!("Opening {:?} @ {address:#04X}", self.path);
                let dev = LinuxI2CDevice::new(&self.path, address as u16)?;
                Ok(slot.insert(dev))
            }
        }
    }
}

impl i2c::ErrorType for LinuxI2c {
    type Error = BusError;
}

impl I2c for LinuxI2c {
    fn transaction(
        &mut self,
        address: SevenBitAddress,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        let dev = self.device(address)?;
        for op in operations {
            match op {
                Operation::Read(buf) => dev.read(buf)?,
                Operation::Write(buf) => dev.write(buf)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct GpioError(sysfs_gpio::Error);

impl fmt::Display for GpioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPIO: {}", self.0)
    }
}

impl digital::Error for GpioError {
    fn kind(&self) -> digital::ErrorKind {
        digital::ErrorKind::Other
    }
}

/// Board reset line through sysfs GPIO. A pin exported here is unexported
/// again on drop, one that was already exported is left as found.
pub struct ResetPin {
    pin: Pin,
    owned: bool,
}

impl ResetPin {
    pub fn export(number: u64) -> Result<Self, sysfs_gpio::Error> {
        let pin = Pin::new(number);
        let owned = !pin.is_exported();
        pin.export()?;
        let reset = Self { pin, owned };
        reset.pin.set_direction(Direction::Out)?;
        Ok(reset)
    }

    /// Gives the pin back to the kernel if it was exported by us
    pub fn release(&mut self) -> Result<(), sysfs_gpio::Error> {
        if !std::mem::take(&mut self.owned) {
            return Ok(());
        }
        log::debug!("Unexporting GPIO {}", self.pin.get_pin());
        self.pin.unexport()
    }
}

impl Drop for ResetPin {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("Could not unexport GPIO {}: {e}", self.pin.get_pin());
        }
    }
}

impl digital::ErrorType for ResetPin {
    type Error = GpioError;
}

impl OutputPin for ResetPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.pin.set_value(0).map_err(GpioError)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.pin.set_value(1).map_err(GpioError)
    }
}

pub struct StdDelay;

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        sleep(Duration::from_nanos(ns.into()))
    }

    fn delay_ms(&mut self, ms: u32) {
        sleep(Duration::from_millis(ms.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::i2c::Error as _;

    fn kind(errno: i32) -> i2c::ErrorKind {
        BusError::from(io::Error::from_raw_os_error(errno)).kind()
    }

    #[test]
    fn missing_slave_is_a_nack() {
        let nack = i2c::ErrorKind::NoAcknowledge(NoAcknowledgeSource::Unknown);
        assert_eq!(kind(ENXIO), nack);
        assert_eq!(kind(EREMOTEIO), nack);
        assert_eq!(kind(EAGAIN), i2c::ErrorKind::ArbitrationLoss);
        assert_eq!(kind(5), i2c::ErrorKind::Other);
    }

    #[test]
    fn bus_error_keeps_the_cause() {
        let err = BusError::from(io::Error::new(io::ErrorKind::NotFound, "no /dev/i2c-9"));
        assert_eq!(err.to_string(), "no /dev/i2c-9");
        assert_eq!(err.kind(), i2c::ErrorKind::Other);
    }

    #[test]
    fn missing_adapter_reported_on_open() {
        let config = BusConfig {
            bus: PathBuf::from("/nonexistent/i2c-42"),
            reset_pin: 4,
            reset_polarity: ResetPolarity::ActiveLow,
        };
        let err = config.vpi().err().unwrap();
        assert!(err.to_string().contains("/nonexistent/i2c-42"), "{err}");
    }

    #[test]
    fn borrowed_pin_is_left_exported() {
        let mut pin = ResetPin {
            pin: Pin::new(4),
            owned: false,
        };
        assert!(pin.release().is_ok());
        assert!(!pin.owned);
    }

    #[test]
    fn release_happens_once() {
        // Not exported on this host, so unexport is a no-op
        let mut pin = ResetPin {
            pin: Pin::new(u64::from(u32::MAX)),
            owned: true,
        };
        assert!(pin.release().is_ok());
        assert!(!pin.owned);
        assert!(pin.release().is_ok());
    }
}
