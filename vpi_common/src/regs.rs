//! Register map and command set of the VPi application firmware.

use core::fmt;
use core::time::Duration;

use packed_struct::derive::PackedStruct;
use packed_struct::PackedStruct;

/// 7-bit address the application firmware answers on
pub const VPI_ADDR: u8 = 0x33;

/// Magic the board expects until it has been identified
pub const DEFAULT_MAGIC: u8 = 0xAA;

/// Largest payload accepted by [`crate::Vpi::write_register`]
pub const MAX_PAYLOAD: usize = 8;

/// Milliseconds per buzzer tick, used for the host side estimate only
pub const TONE_TICK_MS: u64 = 100;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    /// [RO] ID byte (also the command magic) and firmware version
    Identity = 0x00,
    /// [RO] See [`Status`]
    Status = 0x02,
    /// [RO] Button click counters
    Clicks = 0x05,
    /// [RW] PWM frequency for fan and led
    PwmFrequency = 0x18,
    /// [RW] Clock divider
    Divider = 0x1A,
    /// [RW] High level watchdog timeout in seconds, 0 = off
    WatchdogTimeout = 0x1B,
    /// [RW] Wake timer
    WakeTimer = 0x1C,
    /// [RW] Shutdown delay
    ShutdownDelay = 0x1E,
    /// [RW] Sleep period
    SleepPeriod = 0x20,
    /// [RW] Hold time (H)
    HoldTime = 0x22,
    /// [RW] Shutdown grace time (G)
    GraceTime = 0x23,
    /// [RW] Buzzer tone descriptor, see [`Tone`]
    Tone = 0x26,
    /// [WO] Immediate command register, see [`Command`]
    Command = 0x2B,
}

impl Register {
    pub const fn addr(self) -> u8 {
        self as u8
    }

    /// Width of the register on the wire in bytes
    pub const fn size(self) -> usize {
        match self {
            Register::Status
            | Register::Divider
            | Register::WatchdogTimeout
            | Register::HoldTime
            | Register::GraceTime => 1,
            Register::Identity
            | Register::PwmFrequency
            | Register::WakeTimer
            | Register::ShutdownDelay
            | Register::SleepPeriod
            | Register::Command => 2,
            Register::Clicks | Register::Tone => 4,
        }
    }
}

impl From<Register> for u8 {
    fn from(value: Register) -> Self {
        value.addr()
    }
}

static_assertions::const_assert!(Register::Tone.size() <= MAX_PAYLOAD);
static_assertions::const_assert!(Register::Command.size() <= MAX_PAYLOAD);

/// Immediate commands understood by the application firmware.
///
/// The values are fixed by the board firmware and must not change.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Nop = 0x00,
    /// Apply the configuration registers
    Activate = b'A',
    /// Notify the board that the host finished booting
    Boot = b'B',
    /// Feed the high level watchdog
    Feed = b'F',
    /// Cut power immediately
    HardShutdown = b'H',
    /// Power off after the grace time
    Shutdown = b'S',
    /// Clear pending clicks and flags
    Clear = b'C',
    /// Play the tone stored in [`Register::Tone`]
    Beep = b'Z',
    OutputSet = b'1',
    OutputClear = b'0',
    /// Hard reset of the board
    Reset = b'T',
    /// Arm the watchdog with [`Register::WatchdogTimeout`]
    WatchdogSet = b'W',
    WatchdogReset = b'V',
    /// Arm the wake timer with [`Register::WakeTimer`]
    WakeEnable = b'E',
    WakeDisable = b'D',
    /// Wake by IRQ line
    IrqEnable = b'e',
    IrqDisable = b'd',
}

impl From<Command> for u8 {
    fn from(value: Command) -> Self {
        value as u8
    }
}

impl Command {
    /// Payload written to [`Register::Command`]: the code followed by the
    /// code XORed with the session magic.
    pub const fn frame(self, magic: u8) -> [u8; 2] {
        let code = self as u8;
        [code, code ^ magic]
    }
}

/// Status register    7 6 5 4 3 2 1 0
///                    x x I W B E R C
#[derive(PackedStruct, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "1")]
pub struct Status {
    /// C: Clicks pending
    #[packed_field(bits = "0")]
    pub click_pending: bool,
    /// R: Fan RPM updated
    #[packed_field(bits = "1")]
    pub rpm_updated: bool,
    /// E: Error present
    #[packed_field(bits = "2")]
    pub error: bool,
    /// B: Host running (boot acknowledged)
    #[packed_field(bits = "3")]
    pub running: bool,
    /// W: Watchdog enabled
    #[packed_field(bits = "4")]
    pub watchdog_enabled: bool,
    /// I: Interrupt pending
    #[packed_field(bits = "5")]
    pub irq_pending: bool,
}

impl From<u8> for Status {
    fn from(raw: u8) -> Self {
        // All fields are single bits, every byte unpacks
        Self::unpack(&[raw]).unwrap_or_default()
    }
}

/// Button click counters, in the order the board reports them
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Clicks {
    pub power_short: u8,
    pub power_long: u8,
    pub aux_short: u8,
    pub aux_long: u8,
}

impl Clicks {
    pub const fn as_tuple(&self) -> (u8, u8, u8, u8) {
        (self.power_short, self.power_long, self.aux_short, self.aux_long)
    }
}

impl From<[u8; 4]> for Clicks {
    fn from(raw: [u8; 4]) -> Self {
        Self {
            power_short: raw[0],
            power_long: raw[1],
            aux_short: raw[2],
            aux_long: raw[3],
        }
    }
}

/// Contents of the identity register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    /// Chip ID, doubles as the command magic
    pub id: u8,
    pub version: u8,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ID:{:02X}h,VER:{:02X}h", self.id, self.version)
    }
}

/// Configuration registers. Every field is read separately, so the
/// snapshot is not atomic.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub pwm_frequency: u16,
    pub divider: u8,
    pub watchdog_timeout: u8,
    pub wake_timer: u16,
    pub shutdown_delay: u16,
    pub sleep_period: u16,
    pub hold_time: u8,
    pub grace_time: u8,
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PWMF:{},DIV:{},WDG:{},WAK:{},SH:{},SP:{},H:{},G:{}",
            self.pwm_frequency,
            self.divider,
            self.watchdog_timeout,
            self.wake_timer,
            self.shutdown_delay,
            self.sleep_period,
            self.hold_time,
            self.grace_time
        )
    }
}

/// Buzzer tone descriptor
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tone {
    /// Frequency code <off, 2kHz, 1kHz, 500Hz>
    pub frequency: u8,
    /// Number of beeps
    pub count: u8,
    /// Beep time in ticks
    pub duration: u8,
    /// Pause time in ticks
    pub pause: u8,
}

impl Tone {
    pub const fn new(frequency: u8, count: u8, duration: u8, pause: u8) -> Self {
        Self {
            frequency,
            count,
            duration,
            pause,
        }
    }

    /// Wire layout of [`Register::Tone`]. Note the count goes last.
    pub const fn to_bytes(&self) -> [u8; 4] {
        [self.frequency, self.duration, self.pause, self.count]
    }

    /// How long the host should expect the tone to play. The board does not
    /// report completion.
    pub const fn expected_duration(&self) -> Duration {
        let per_beep = (self.duration as u64 + self.pause as u64) * TONE_TICK_MS;
        Duration::from_millis(self.count as u64 * per_beep)
    }
}
