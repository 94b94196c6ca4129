//! 8253/8254 programmable interval timer

use crate::arch::port::outb;
use crate::time::TICK_MS;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
const PIT_BASE_HZ: u32 = 1_193_182;

/// Program channel 0 for the scheduler tick in rate-generator mode.
pub fn program_tick() {
    let hz = 1000 / TICK_MS as u32;
    let divisor = PIT_BASE_HZ / hz;
    unsafe {
        outb(PIT_COMMAND, 0x36);
        outb(PIT_CHANNEL0, divisor as u8);
        outb(PIT_CHANNEL0, (divisor >> 8) as u8);
    }
}
