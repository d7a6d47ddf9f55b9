use std::{collections::BTreeMap, fs, path::PathBuf, thread::sleep, time::{Duration, Instant}};

use clap::*;
use clap_num::maybe_hex;
use color_eyre::{eyre::{Report, Result}, owo_colors::OwoColorize};
use console::style;
use indicatif::{HumanBytes, HumanDuration, MultiProgress, ProgressBar, ProgressStyle};
use vpi_common::{bootload::Preamble, FirmwareImage, ResetPolarity, Status, Tone, Vpi};

use crate::linux_bus::{BusConfig, LinuxI2c, StdDelay};

mod linux_bus;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Switch {
    On,
    Off,
}

impl From<Switch> for bool {
    fn from(value: Switch) -> Self {
        matches!(value, Switch::On)
    }
}

#[derive(Subcommand, Clone)]
pub enum Command {
    /// Print block count and CRC of a firmware image (no board needed)
    Checksum { file: PathBuf },
    /// Flash a firmware image through the bootloader
    Flash { file: PathBuf },
    /// Read out board identification
    Ident,
    /// Show the status flags
    Status,
    /// Show button click counters
    Clicks,
    /// Dump the configuration registers, or change them with `config set`
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
    /// Read a raw register
    Read {
        #[clap(value_parser=maybe_hex::<u8>)]
        register: u8,
        #[clap(default_value_t = 1)]
        len: usize,
    },
    /// Write raw bytes to a register
    Write {
        #[clap(value_parser=maybe_hex::<u8>)]
        register: u8,
        #[clap(value_parser=maybe_hex::<u8>, required = true)]
        bytes: Vec<u8>,
    },
    /// Set the high level watchdog timeout, 0 disables it
    Watchdog { seconds: u8 },
    /// Set the wake timer, 0 disables it
    Wake { seconds: u16 },
    /// Feed the watchdog
    Feed,
    /// Play a tone on the buzzer
    Beep {
        #[clap(value_parser=maybe_hex::<u8>)]
        frequency: u8,
        count: u8,
        /// Beep time in ticks
        duration: u8,
        /// Pause time in ticks
        pause: u8,
        /// Block until the tone should be over
        #[clap(long, short, action)]
        wait: bool,
    },
    /// Tell the board the host has booted
    Boot,
    /// Clear pending clicks and flags
    Clear,
    /// Hard reset of the board
    Reset,
    /// Power the host off
    Shutdown {
        /// Cut power immediately instead of waiting for the grace time
        #[clap(long, action)]
        hard: bool,
    },
    /// Switch the digital output
    Output {
        #[clap(value_enum)]
        state: Switch,
    },
    /// Wake the host by the IRQ line
    IrqWake {
        #[clap(value_enum)]
        state: Switch,
    },
}

#[derive(Subcommand, Clone, Debug, PartialEq, Eq)]
pub enum ConfigAction {
    /// Write the given fields, then make the board apply them
    Set(ConfigUpdate),
}

#[derive(Args, Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigUpdate {
    /// PWM frequency for fan and led
    #[arg(long)]
    pub pwm_frequency: Option<u16>,
    /// Fan pulses per revolution divider
    #[arg(long)]
    pub divider: Option<u8>,
    #[arg(long)]
    pub shutdown_delay: Option<u16>,
    #[arg(long)]
    pub sleep_period: Option<u16>,
    /// Hold time in seconds
    #[arg(long)]
    pub hold_time: Option<u8>,
    /// Shutdown grace time in seconds
    #[arg(long)]
    pub grace_time: Option<u8>,
}

impl ConfigUpdate {
    pub fn apply<I2C, D>(&self, vpi: &mut Vpi<I2C, D>) -> vpi_common::Result<()>
    where
        I2C: embedded_hal::i2c::I2c,
        D: embedded_hal::delay::DelayNs,
    {
        if let Some(v) = self.pwm_frequency {
            vpi.set_pwm_frequency(v)?;
        }
        if let Some(v) = self.divider {
            vpi.set_divider(v)?;
        }
        if let Some(v) = self.shutdown_delay {
            vpi.set_shutdown_delay(v)?;
        }
        if let Some(v) = self.sleep_period {
            vpi.set_sleep_period(v)?;
        }
        if let Some(v) = self.hold_time {
            vpi.set_hold_time(v)?;
        }
        if let Some(v) = self.grace_time {
            vpi.set_grace_time(v)?;
        }
        vpi.apply_config()
    }
}

#[derive(clap::Parser, Clone)]
#[command(version, about)]
pub struct Flasher {
    #[command(subcommand)]
    pub command: Command,
    /// I2C bus the board is attached to
    #[arg(long, global = true, env = "VPI_I2C_BUS", default_value = "/dev/i2c-1")]
    pub bus: PathBuf,
    /// sysfs GPIO number of the board reset line
    #[arg(long, global = true, env = "VPI_RESET_PIN", default_value_t = 4)]
    pub reset_pin: u64,
    /// Reset line is not inverted
    #[arg(long, global = true, action)]
    pub reset_active_high: bool,
}

impl From<&Flasher> for BusConfig {
    fn from(args: &Flasher) -> Self {
        BusConfig {
            bus: args.bus.clone(),
            reset_pin: args.reset_pin,
            reset_polarity: if args.reset_active_high {
                ResetPolarity::ActiveHigh
            } else {
                ResetPolarity::ActiveLow
            },
        }
    }
}

fn next_spinner(mp: &MultiProgress, last_bar: Option<ProgressBar>, stage: u32, out_of: u32) -> ProgressBar {
    if let Some(last_bar) = last_bar {
        let old_msg = last_bar.message();
        last_bar.finish_with_message(format!("{old_msg} {}", style("✔").green()));
    }

    let next_bar = mp.add(ProgressBar::new_spinner());
    let spinner_style = ProgressStyle::with_template("{prefix:.bold.dim} {spinner} {wide_msg}")
        .unwrap()
        .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ");
    next_bar.set_style(spinner_style);
    next_bar.set_prefix(format!("[{stage}/{out_of}]"));
    next_bar.enable_steady_tick(Duration::from_millis(100));
    next_bar
}

fn checksum(file: &PathBuf) -> Result<(), Report> {
    let bytes = fs::read(file)?;
    let image = FirmwareImage::new(&bytes);
    let preamble = Preamble::for_image(&image)?;
    println!("{}", style(format!("{file:?}")).bold().bright_blue());
    println!("{: <8}: {}", style("Size").bold(), HumanBytes(image.len() as u64));
    println!("{: <8}: {}", style("Blocks").bold(), preamble.blocks);
    println!("{: <8}: {:02X}", style("CRC").bold(), preamble.checksum);
    Ok(())
}

fn flash(mp: &MultiProgress, file: &PathBuf, config: &BusConfig) -> Result<(), Report> {
    let bytes = fs::read(file)?;
    let image = FirmwareImage::new(&bytes);
    let preamble = Preamble::for_image(&image)?;
    log::info!("Firmware read. blocks={}, CRC={:02X}", preamble.blocks, preamble.checksum);

    let mut loader = config.bootloader()?;
    let spinner = next_spinner(mp, None, 1, 3);
    spinner.set_message(format!(
        "Enter bootloader ({} blocks, CRC {:02X})",
        preamble.blocks, preamble.checksum
    ));
    if !loader.enter(&preamble)? {
        return Err(Report::msg("Bootloader activation response: NACK"));
    }

    let spinner = next_spinner(mp, Some(spinner), 2, 3);
    spinner.set_message(format!("Transfering data ({})", HumanBytes(image.len() as u64)));
    let pb = mp.add(ProgressBar::new(image.block_count() as u64).with_message("Blocks"))
        .with_style(ProgressStyle::with_template("{percent}% [{bar:40.cyan/blue}] {msg} {pos}/{len} ETA: {eta}")
        .unwrap()
        .progress_chars("##-")
    );
    loader.transfer(&image, |sent, _| pb.set_position(sent as u64))?;
    pb.finish_with_message(format!("{}", style("✔").green()));

    let spinner = next_spinner(mp, Some(spinner), 3, 3);
    spinner.set_message("Confirming upload");
    if !loader.finish()? {
        return Err(Report::msg("Bootloader rejected the image (CRC mismatch?)"));
    }
    spinner.finish_with_message(format!("{} {}", spinner.message(), style("✔").green()));
    Ok(())
}

fn yes_no(v: bool) -> String {
    if v {
        format!("{}", style("Yes").bold().green())
    } else {
        format!("{}", style("No").dim())
    }
}

fn print_table(title: &str, map: BTreeMap<&'static str, String>) {
    println!("{}", style(title).bold().bright_blue());
    for (k, v) in map {
        println!("{: <20}: {}", style(k).bold(), v);
    }
}

fn ident(config: &BusConfig) -> Result<(), Report> {
    let vpi = config.vpi()?;
    let mut map = BTreeMap::new();
    if let Some(ident) = vpi.identity() {
        map.insert("Chip ID", format!("{:02X}h", ident.id));
        map.insert("Firmware version", format!("{:02X}h", ident.version));
    }
    map.insert("Command magic", format!("{:02X}h", vpi.magic()));
    print_table("Identification information", map);
    Ok(())
}

fn status(config: &BusConfig) -> Result<(), Report> {
    let mut vpi = config.vpi()?;
    let Status {
        click_pending,
        rpm_updated,
        error,
        running,
        watchdog_enabled,
        irq_pending,
    } = vpi.read_status()?;
    let mut map = BTreeMap::new();
    map.insert("Running", yes_no(running));
    map.insert("IRQ pending", yes_no(irq_pending));
    map.insert("Click pending", yes_no(click_pending));
    map.insert("Watchdog enabled", yes_no(watchdog_enabled));
    map.insert("RPM updated", yes_no(rpm_updated));
    map.insert("Error", yes_no(error));
    print_table("Board status", map);
    Ok(())
}

fn clicks(config: &BusConfig) -> Result<(), Report> {
    let c = config.vpi()?.read_clicks()?;
    let mut map = BTreeMap::new();
    map.insert("Power short", c.power_short.to_string());
    map.insert("Power long", c.power_long.to_string());
    map.insert("Aux short", c.aux_short.to_string());
    map.insert("Aux long", c.aux_long.to_string());
    print_table("Button clicks", map);
    Ok(())
}

fn dump_config(config: &BusConfig) -> Result<(), Report> {
    let cfg = config.vpi()?.dump_config()?;
    log::debug!("{cfg}");
    let mut map = BTreeMap::new();
    map.insert("PWM frequency", cfg.pwm_frequency.to_string());
    map.insert("Divider", cfg.divider.to_string());
    map.insert("Watchdog timeout", cfg.watchdog_timeout.to_string());
    map.insert("Wake timer", cfg.wake_timer.to_string());
    map.insert("Shutdown delay", cfg.shutdown_delay.to_string());
    map.insert("Sleep period", cfg.sleep_period.to_string());
    map.insert("Hold time", cfg.hold_time.to_string());
    map.insert("Grace time", cfg.grace_time.to_string());
    print_table("Configuration", map);
    Ok(())
}

fn set_config(config: &BusConfig, update: &ConfigUpdate) -> Result<(), Report> {
    if *update == ConfigUpdate::default() {
        return Err(Report::msg("Nothing to set, see `config set --help`"));
    }
    let mut vpi = config.vpi()?;
    update.apply(&mut vpi)?;
    println!("{}", style("Configuration applied").bold().green());
    dump_config(config)
}

fn read_register(config: &BusConfig, register: u8, len: usize) -> Result<(), Report> {
    let mut buf = vec![0; len];
    config.vpi()?.read_into(register, &mut buf)?;
    println!("0x{register:02X}: {buf:02X?}");
    Ok(())
}

/// Plain command, nothing to show but errors
fn send<F>(config: &BusConfig, f: F) -> Result<(), Report>
where
    F: FnOnce(&mut Vpi<LinuxI2c, StdDelay>) -> vpi_common::Result<()>,
{
    let mut vpi = config.vpi()?;
    f(&mut vpi)?;
    Ok(())
}

fn beep(config: &BusConfig, tone: Tone, wait: bool) -> Result<(), Report> {
    let expected = config.vpi()?.beep(tone)?;
    if wait {
        println!("Waiting {}", HumanDuration(expected));
        sleep(expected);
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    color_eyre::install()?;
    let start_timer = Instant::now();
    let args = Flasher::parse();

    if let Command::Checksum { file } = &args.command {
        checksum(file)?;
        return Ok(());
    }

    let config = BusConfig::from(&args);
    let mp = MultiProgress::new();
    let res = match &args.command {
        Command::Flash { file } => {
            println!("{}", style("Flashing firmware").bold().green());
            flash(&mp, file, &config)
        }
        Command::Ident => ident(&config),
        Command::Status => status(&config),
        Command::Clicks => clicks(&config),
        Command::Config { action: None } => dump_config(&config),
        Command::Config { action: Some(ConfigAction::Set(update)) } => set_config(&config, update),
        Command::Read { register, len } => read_register(&config, *register, *len),
        Command::Write { register, bytes } => send(&config, |v| v.write_register(*register, bytes)),
        Command::Watchdog { seconds } => send(&config, |v| v.set_watchdog(*seconds)),
        Command::Wake { seconds } => send(&config, |v| v.set_wake(*seconds)),
        Command::Feed => send(&config, |v| v.feed()),
        Command::Beep { frequency, count, duration, pause, wait } => {
            beep(&config, Tone::new(*frequency, *count, *duration, *pause), *wait)
        }
        Command::Boot => send(&config, |v| v.boot()),
        Command::Clear => send(&config, |v| v.clear()),
        Command::Reset => send(&config, |v| v.reset()),
        Command::Shutdown { hard: true } => send(&config, |v| v.hard_shutdown()),
        Command::Shutdown { hard: false } => send(&config, |v| v.shutdown()),
        Command::Output { state } => send(&config, |v| v.set_output((*state).into())),
        Command::IrqWake { state } => send(&config, |v| v.set_irq_wake((*state).into())),
        Command::Checksum { .. } => unreachable!(),
    };
    if res.is_err() {
        mp.clear()?;
    }
    res?;

    println!(
        "{}",
        style(format!("Completed in {}", HumanDuration(start_timer.elapsed()))).bold().green()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::delay::DelayNs;
    use embedded_hal_mock::eh1::i2c::{Mock as I2cMock, Transaction as I2cTransaction};
    use vpi_common::regs::{DEFAULT_MAGIC, VPI_ADDR};

    struct NoDelay;

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    fn parse(args: &[&str]) -> Flasher {
        let mut argv = vec!["vpi-flasher"];
        argv.extend_from_slice(args);
        Flasher::try_parse_from(argv).unwrap()
    }

    #[test]
    fn config_without_action_dumps() {
        assert!(matches!(parse(&["config"]).command, Command::Config { action: None }));
    }

    #[test]
    fn config_set_parses_fields() {
        let args = parse(&["config", "set", "--pwm-frequency", "25000", "--grace-time", "15"]);
        let Command::Config { action: Some(ConfigAction::Set(update)) } = args.command else {
            panic!("not a config set");
        };
        assert_eq!(
            update,
            ConfigUpdate {
                pwm_frequency: Some(25000),
                grace_time: Some(15),
                ..Default::default()
            }
        );
    }

    #[test]
    fn write_accepts_hex() {
        let args = parse(&["write", "0x1B", "0x0A"]);
        let Command::Write { register, bytes } = args.command else {
            panic!("not a write");
        };
        assert_eq!(register, 0x1B);
        assert_eq!(bytes, [0x0A]);
        assert!(Flasher::try_parse_from(["vpi-flasher", "write", "0x1B"]).is_err());
    }

    #[test]
    fn config_update_writes_given_fields_then_activates() {
        let mut i2c = I2cMock::new(&[
            I2cTransaction::write(VPI_ADDR, vec![0x1A, 4]),
            I2cTransaction::write(VPI_ADDR, vec![0x22, 8]),
            I2cTransaction::write(VPI_ADDR, vec![0x2B, b'A', b'A' ^ DEFAULT_MAGIC]),
        ]);
        let mut vpi = Vpi::new(&mut i2c, NoDelay);
        let update = ConfigUpdate {
            divider: Some(4),
            hold_time: Some(8),
            ..Default::default()
        };
        update.apply(&mut vpi).unwrap();
        drop(vpi);
        i2c.done();
    }
}
