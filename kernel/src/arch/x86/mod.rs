//! Protected-mode x86 support: 16550 UART, legacy PIC and the PIT
//! timer driving the scheduler tick.

pub mod pic;
pub mod pit;
pub mod uart;

/// Remap the PICs, program the 10 ms timer tick and unmask its line.
pub fn init() {
    pic::remap(0x20, 0x28);
    pit::program_tick();
    pic::unmask(0);
}

/// Timer interrupt body, called from the IRQ0 stub.
pub fn timer_interrupt() {
    crate::time::tick();
    pic::end_of_interrupt(0);
    crate::sched::scheduler_tick();
}
