use core::fmt::{self, Arguments, Write};
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

#[cfg(target_arch = "x86_64")]
use {lazy_static::lazy_static, spinning_top::Spinlock, uart_16550::SerialPort};

#[cfg(target_arch = "x86_64")]
lazy_static! {
    pub static ref SERIAL1: Spinlock<SerialPort> = {
        let mut serial_port = unsafe { SerialPort::new(0x3F8) };
        serial_port.init();
        Spinlock::new(serial_port)
    };
}

/// Sends `log` records to COM1.
pub struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        #[cfg(target_arch = "x86_64")]
        x86_64::instructions::interrupts::without_interrupts(|| {
            let mut serial = SERIAL1.lock();
            // Nowhere to report a failing serial line.
            let _ = format_record(&mut *serial, record.level(), record.args(), record.file(), record.line());
            let _ = serial.write_char('\n');
        });
    }

    fn flush(&self) {}
}

/// Installs `KernelLogger` as the global logger.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

fn style(level: Level) -> (&'static str, &'static str, &'static str) {
    match level {
        Level::Error => ("\x1b[31m", "(X_X) ", "[ERROR]"),
        Level::Warn => ("\x1b[33m", "(0_0) ", "[WARN ]"),
        Level::Info => ("\x1b[34m", "(o_o) ", "[INFO ]"),
        Level::Debug => ("\x1b[36m", "(-_-) ", "[DEBUG]"),
        Level::Trace => ("\x1b[90m", "(-_-) ", "[TRACE]"),
    }
}

/// Renders one log line, without the trailing newline.
///
/// Warnings and errors carry the source location.
pub fn format_record(
    out: &mut impl Write,
    level: Level,
    args: &Arguments,
    file: Option<&str>,
    line: Option<u32>,
) -> fmt::Result {
    let (colour, face, tag) = style(level);
    let face = if cfg!(feature = "status-faces") { face } else { "" };

    write!(out, "{}{}{}:\x1b[0m {}", colour, face, tag, args)?;
    if level <= Level::Warn {
        write!(out, " [{}@L{}]", file.unwrap_or("?"), line.unwrap_or(0))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(face: &str) -> &str {
        if cfg!(feature = "status-faces") { face } else { "" }
    }

    #[test]
    fn info_line() {
        let mut out = String::new();
        format_record(&mut out, Level::Info, &format_args!("{} drive found at port {}", "SATA", 0), None, None)
            .unwrap();
        assert_eq!(out, format!("\x1b[34m{}[INFO ]:\x1b[0m SATA drive found at port 0", face("(o_o) ")));
    }

    #[test]
    fn errors_carry_their_location() {
        let mut out = String::new();
        format_record(&mut out, Level::Error, &format_args!("port hung"), Some("src/disks/ahci.rs"), Some(42))
            .unwrap();
        assert_eq!(out, format!("\x1b[31m{}[ERROR]:\x1b[0m port hung [src/disks/ahci.rs@L42]", face("(X_X) ")));

        let mut out = String::new();
        format_record(&mut out, Level::Warn, &format_args!("no slot"), None, None).unwrap();
        assert!(out.starts_with("\x1b[33m"));
        assert!(out.ends_with("no slot [?@L0]"));
    }

    #[test]
    fn debug_has_no_location() {
        let mut out = String::new();
        format_record(&mut out, Level::Debug, &format_args!("clb {:#x}", 0x40_0000), Some("x.rs"), Some(1)).unwrap();
        assert!(out.ends_with("[DEBUG]:\x1b[0m clb 0x400000"));
    }
}
