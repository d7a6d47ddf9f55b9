//! Register and command protocol of the running VPi application firmware.
//!
//! Commands are authenticated with a magic byte, the chip ID read from
//! [`Register::Identity`]. [`Vpi::identify`] has to run before commands mean
//! anything to the board; [`Vpi::connect`] does that for you. If the board
//! was reset since, re-identify: commands with a stale magic are accepted on
//! the bus and silently dropped by the board.

use core::time::Duration;

use embedded_hal::{delay::DelayNs, i2c::I2c};

use crate::error::{bus_error, Error, Result};
use crate::regs::{
    Clicks, Command, Config, Identity, Register, Status, Tone, DEFAULT_MAGIC, MAX_PAYLOAD,
    VPI_ADDR,
};

/// Time the board needs between the register address and the answer
const READ_TURNAROUND_MS: u32 = 5;
/// Minimum gap before a register write
const WRITE_GAP_MS: u32 = 3;

/// One session with the application firmware.
pub struct Vpi<I2C, D> {
    i2c: I2C,
    delay: D,
    magic: u8,
    identity: Option<Identity>,
}

impl<I2C, D> Vpi<I2C, D>
where
    I2C: I2c,
    D: DelayNs,
{
    /// Unidentified session, commands use [`DEFAULT_MAGIC`] until
    /// [`Self::identify`] is called.
    pub fn new(i2c: I2C, delay: D) -> Self {
        Self {
            i2c,
            delay,
            magic: DEFAULT_MAGIC,
            identity: None,
        }
    }

    /// Opens a session and identifies the board
    pub fn connect(i2c: I2C, delay: D) -> Result<Self> {
        let mut vpi = Self::new(i2c, delay);
        vpi.identify()?;
        Ok(vpi)
    }

    pub fn release(self) -> (I2C, D) {
        (self.i2c, self.delay)
    }

    pub fn magic(&self) -> u8 {
        self.magic
    }

    /// Identity cached by the last [`Self::identify`]
    pub fn identity(&self) -> Option<Identity> {
        self.identity
    }

    pub fn read_into(&mut self, reg: impl Into<u8>, buf: &mut [u8]) -> Result<()> {
        let reg = reg.into();
        self.i2c.write(VPI_ADDR, &[reg]).map_err(bus_error)?;
        self.delay.delay_ms(READ_TURNAROUND_MS);
        self.i2c.read(VPI_ADDR, buf).map_err(bus_error)?;
        log::trace!("R {reg:02X}: {buf:02X?}");
        Ok(())
    }

    pub fn read_register<const N: usize>(&mut self, reg: impl Into<u8>) -> Result<[u8; N]> {
        let mut buf = [0; N];
        self.read_into(reg, &mut buf)?;
        Ok(buf)
    }

    /// Writes the register address followed by `payload` in one transfer
    pub fn write_register(&mut self, reg: impl Into<u8>, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::PayloadTooLong { len: payload.len() });
        }
        let mut frame = [0; MAX_PAYLOAD + 1];
        frame[0] = reg.into();
        frame[1..=payload.len()].copy_from_slice(payload);
        let frame = &frame[..=payload.len()];
        self.delay.delay_ms(WRITE_GAP_MS);
        log::trace!("W {frame:02X?}");
        self.i2c.write(VPI_ADDR, frame).map_err(bus_error)
    }

    fn read_u8(&mut self, reg: Register) -> Result<u8> {
        let [v]: [u8; 1] = self.read_register(reg)?;
        Ok(v)
    }

    fn read_u16(&mut self, reg: Register) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_register(reg)?))
    }

    /// Reads the identity register and adopts the ID byte as command magic
    pub fn identify(&mut self) -> Result<Identity> {
        let [id, version]: [u8; 2] = self.read_register(Register::Identity)?;
        let identity = Identity { id, version };
        self.magic = id;
        self.identity = Some(identity);
        log::debug!("Board identified: {identity}");
        Ok(identity)
    }

    /// Sends `cmd` authenticated with the session magic.
    ///
    /// Best effort: the board never acknowledges commands, `Ok` only means
    /// the bus transfer went through.
    pub fn command(&mut self, cmd: Command) -> Result<()> {
        log::debug!("Command {cmd:?}");
        self.write_register(Register::Command, &cmd.frame(self.magic))
    }

    pub fn boot(&mut self) -> Result<()> {
        self.command(Command::Boot)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.command(Command::Clear)
    }

    pub fn feed(&mut self) -> Result<()> {
        self.command(Command::Feed)
    }

    pub fn reset(&mut self) -> Result<()> {
        self.command(Command::Reset)
    }

    pub fn shutdown(&mut self) -> Result<()> {
        self.command(Command::Shutdown)
    }

    pub fn hard_shutdown(&mut self) -> Result<()> {
        self.command(Command::HardShutdown)
    }

    pub fn set_output(&mut self, on: bool) -> Result<()> {
        self.command(if on {
            Command::OutputSet
        } else {
            Command::OutputClear
        })
    }

    /// Wake the host when the IRQ line goes low
    pub fn set_irq_wake(&mut self, enable: bool) -> Result<()> {
        self.command(if enable {
            Command::IrqEnable
        } else {
            Command::IrqDisable
        })
    }

    pub fn read_status(&mut self) -> Result<Status> {
        Ok(Status::from(self.read_u8(Register::Status)?))
    }

    pub fn is_running(&mut self) -> Result<bool> {
        Ok(self.read_status()?.running)
    }

    pub fn has_irq(&mut self) -> Result<bool> {
        Ok(self.read_status()?.irq_pending)
    }

    pub fn has_click(&mut self) -> Result<bool> {
        Ok(self.read_status()?.click_pending)
    }

    pub fn read_clicks(&mut self) -> Result<Clicks> {
        let raw: [u8; 4] = self.read_register(Register::Clicks)?;
        Ok(Clicks::from(raw))
    }

    /// Writes the watchdog timeout, then arms the watchdog (or disarms it
    /// for 0). Two separate transfers.
    pub fn set_watchdog(&mut self, seconds: u8) -> Result<()> {
        self.write_register(Register::WatchdogTimeout, &[seconds])?;
        self.command(if seconds == 0 {
            Command::WatchdogReset
        } else {
            Command::WatchdogSet
        })
    }

    /// Writes the wake timer, then enables wake (or disables it for 0).
    /// Two separate transfers.
    pub fn set_wake(&mut self, seconds: u16) -> Result<()> {
        self.write_register(Register::WakeTimer, &seconds.to_be_bytes())?;
        self.command(if seconds == 0 {
            Command::WakeDisable
        } else {
            Command::WakeEnable
        })
    }

    pub fn dump_config(&mut self) -> Result<Config> {
        Ok(Config {
            pwm_frequency: self.read_u16(Register::PwmFrequency)?,
            divider: self.read_u8(Register::Divider)?,
            watchdog_timeout: self.read_u8(Register::WatchdogTimeout)?,
            wake_timer: self.read_u16(Register::WakeTimer)?,
            shutdown_delay: self.read_u16(Register::ShutdownDelay)?,
            sleep_period: self.read_u16(Register::SleepPeriod)?,
            hold_time: self.read_u8(Register::HoldTime)?,
            grace_time: self.read_u8(Register::GraceTime)?,
        })
    }

    // Configuration writes land in the registers only, the board switches
    // over on `apply_config`.

    pub fn set_pwm_frequency(&mut self, hz: u16) -> Result<()> {
        self.write_register(Register::PwmFrequency, &hz.to_be_bytes())
    }

    pub fn set_divider(&mut self, divider: u8) -> Result<()> {
        self.write_register(Register::Divider, &[divider])
    }

    pub fn set_shutdown_delay(&mut self, delay: u16) -> Result<()> {
        self.write_register(Register::ShutdownDelay, &delay.to_be_bytes())
    }

    pub fn set_sleep_period(&mut self, period: u16) -> Result<()> {
        self.write_register(Register::SleepPeriod, &period.to_be_bytes())
    }

    pub fn set_hold_time(&mut self, seconds: u8) -> Result<()> {
        self.write_register(Register::HoldTime, &[seconds])
    }

    pub fn set_grace_time(&mut self, seconds: u8) -> Result<()> {
        self.write_register(Register::GraceTime, &[seconds])
    }

    /// Makes the board take over the configuration registers
    pub fn apply_config(&mut self) -> Result<()> {
        self.command(Command::Activate)
    }

    /// Plays `tone`. Returns how long the host should wait for it to finish,
    /// the board does not report it.
    pub fn beep(&mut self, tone: Tone) -> Result<Duration> {
        self.write_register(Register::Tone, &tone.to_bytes())?;
        self.command(Command::Beep)?;
        Ok(tone.expected_duration())
    }
}
