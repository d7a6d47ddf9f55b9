use embedded_hal::delay::DelayNs;
use embedded_hal_mock::eh1::digital::{
    Mock as PinMock, State as PinState, Transaction as PinTransaction,
};
use embedded_hal_mock::eh1::i2c::{Mock as I2cMock, Transaction as I2cTransaction};
use vpi_common::bootload::{BOOT_ADDR, BOOT_ACK};
use vpi_common::regs::VPI_ADDR;
use vpi_common::{Bootloader, FirmwareImage, Tone, Vpi};

#[derive(Default)]
struct NoDelay {
    total_ms: u64,
}

impl DelayNs for NoDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.total_ms += u64::from(ns) / 1_000_000;
    }

    fn delay_ms(&mut self, ms: u32) {
        self.total_ms += u64::from(ms);
    }
}

fn reset_pulse() -> [PinTransaction; 3] {
    [
        PinTransaction::set(PinState::Low),
        PinTransaction::set(PinState::High),
        PinTransaction::set(PinState::Low),
    ]
}

#[test]
fn flash_130_bytes_then_operate() {
    let firmware: Vec<u8> = (0..130u8).collect();
    let image = FirmwareImage::new(&firmware);
    assert_eq!(image.checksum(), 0x15);
    assert_eq!(image.block_count(), 3);

    let mut expectations = vec![
        I2cTransaction::write(BOOT_ADDR, vec![0xDE, 0xAD, 0xBE, 0xEF, 3, 0x15, 0x15]),
        I2cTransaction::read(BOOT_ADDR, BOOT_ACK.to_vec()),
    ];
    for chunk in firmware.chunks(64) {
        let mut block = chunk.to_vec();
        block.resize(64, 0xFF);
        expectations.push(I2cTransaction::write(BOOT_ADDR, block));
    }
    expectations.push(I2cTransaction::read(BOOT_ADDR, BOOT_ACK.to_vec()));

    // Application side: identify, boot, status, beep
    let magic = 0xA5;
    expectations.extend([
        I2cTransaction::write(VPI_ADDR, vec![0x00]),
        I2cTransaction::read(VPI_ADDR, vec![magic, 0x07]),
        I2cTransaction::write(VPI_ADDR, vec![0x2B, b'B', b'B' ^ magic]),
        I2cTransaction::write(VPI_ADDR, vec![0x02]),
        I2cTransaction::read(VPI_ADDR, vec![0x08]),
        I2cTransaction::write(VPI_ADDR, vec![0x26, 2, 1, 1, 2]),
        I2cTransaction::write(VPI_ADDR, vec![0x2B, b'Z', b'Z' ^ magic]),
    ]);

    let mut i2c = I2cMock::new(&expectations);
    let mut pin = PinMock::new(&[reset_pulse(), reset_pulse()].concat());
    let mut delay = NoDelay::default();

    let mut loader = Bootloader::new(&mut i2c, &mut pin, &mut delay);
    assert!(loader.upload(&image).unwrap());
    drop(loader);
    // 2 resets, 2 ack waits, 3 blocks
    assert_eq!(delay.total_ms, 2 * 415 + 2 * 10 + 3 * 50);

    let mut vpi = Vpi::connect(&mut i2c, &mut delay).unwrap();
    assert_eq!(vpi.magic(), magic);
    vpi.boot().unwrap();
    assert!(vpi.is_running().unwrap());
    let wait = vpi.beep(Tone::new(2, 2, 1, 1)).unwrap();
    assert_eq!(wait.as_millis(), 400);
    drop(vpi);

    i2c.done();
    pin.done();
}

#[test]
fn refused_entry_leaves_bus_alone() {
    let firmware = [0u8; 100];
    let crc = vpi_common::compute_checksum(&firmware);
    let mut i2c = I2cMock::new(&[
        I2cTransaction::write(BOOT_ADDR, vec![0xDE, 0xAD, 0xBE, 0xEF, 2, crc, crc]),
        I2cTransaction::read(BOOT_ADDR, vec![0x00, 0x00]),
    ]);
    let mut pin = PinMock::new(&reset_pulse());
    let mut loader = Bootloader::new(&mut i2c, &mut pin, NoDelay::default());
    assert!(!loader.upload(&FirmwareImage::new(&firmware)).unwrap());
    drop(loader);
    i2c.done();
    pin.done();
}
