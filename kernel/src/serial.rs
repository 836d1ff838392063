//! Serial console back-end for kernel logging
//!
//! x86_64 uses the first 16550 COM port; aarch64 writes to the PL011 UART
//! of the QEMU virt machine by raw MMIO. On the host (unit tests) the
//! console is a no-op: the logger is simply never installed there.

use core::fmt;

use spin::Mutex;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod port {
    use uart_16550::SerialPort;

    /// I/O port of COM1
    const COM1: u16 = 0x3F8;

    pub struct Console {
        port: SerialPort,
    }

    impl Console {
        pub const fn new() -> Self {
            // SAFETY: COM1 is the standard 16550 I/O port block; probing and
            // writing it has no effect beyond the UART itself.
            Self {
                port: unsafe { SerialPort::new(COM1) },
            }
        }

        pub fn init(&mut self) {
            self.port.init();
        }

        pub fn write_str(&mut self, s: &str) {
            use core::fmt::Write;
            let _ = self.port.write_str(s);
        }
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
mod port {
    /// PL011 UART data register on the QEMU virt machine
    const PL011_DR: *mut u32 = 0x0900_0000 as *mut u32;
    /// PL011 flag register; bit 5 = TX FIFO full
    const PL011_FR: *const u32 = 0x0900_0018 as *const u32;

    pub struct Console;

    impl Console {
        pub const fn new() -> Self {
            Self
        }

        pub fn init(&mut self) {}

        pub fn write_str(&mut self, s: &str) {
            for byte in s.bytes() {
                // SAFETY: The PL011 registers are memory mapped by the
                // platform; polling FR and writing DR is the architectural
                // transmit sequence and touches nothing else.
                unsafe {
                    while core::ptr::read_volatile(PL011_FR) & (1 << 5) != 0 {
                        core::hint::spin_loop();
                    }
                    core::ptr::write_volatile(PL011_DR, u32::from(byte));
                }
            }
        }
    }
}

#[cfg(not(target_os = "none"))]
mod port {
    pub struct Console;

    impl Console {
        pub const fn new() -> Self {
            Self
        }

        pub fn init(&mut self) {}

        pub fn write_str(&mut self, _s: &str) {}
    }
}

static CONSOLE: Mutex<port::Console> = Mutex::new(port::Console::new());

/// Initialize the serial console. Called once by the BSP before the logger
/// is installed.
pub fn init() {
    CONSOLE.lock().init();
}

/// Write a string to the serial console
pub fn write_str(s: &str) {
    CONSOLE.lock().write_str(s);
}

/// Write formatted output to the serial console
pub fn write_fmt(args: fmt::Arguments<'_>) {
    struct Writer;

    impl fmt::Write for Writer {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            write_str(s);
            Ok(())
        }
    }

    use fmt::Write;
    let _ = Writer.write_fmt(args);
}
