//! Serial console sink
//!
//! All kernel text output funnels through here. Bare metal talks to the
//! COM1 UART; hosted builds swallow the bytes (the test harness has its
//! own output).

use core::fmt;

use spin::Mutex;

pub struct SerialConsole;

impl fmt::Write for SerialConsole {
    fn write_str(&mut self, text: &str) -> fmt::Result {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        crate::arch::x86::uart::write_str(text);
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        {
            let _ = text;
        }
        Ok(())
    }
}

static CONSOLE: Mutex<SerialConsole> = Mutex::new(SerialConsole);

pub fn init() {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    crate::arch::x86::uart::init();
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    let _ = CONSOLE.lock().write_fmt(args);
}
