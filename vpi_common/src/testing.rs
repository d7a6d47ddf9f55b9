use embedded_hal::delay::DelayNs;

/// Delay that only records the requested sleeps, in milliseconds
#[derive(Debug, Default)]
pub struct RecordingDelay {
    pub log: Vec<u32>,
}

impl DelayNs for RecordingDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.log.push(ns / 1_000_000);
    }

    fn delay_ms(&mut self, ms: u32) {
        self.log.push(ms);
    }
}
