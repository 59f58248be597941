//! `log` backend writing to the console.

use core::fmt::{self, Write};

use ansi_rgb::Foreground;
use log::{Level, LevelFilter, Log, Metadata, Record};
use rgb::RGB8;
use spin::Mutex;

use crate::{arch, error::KResult, kerr};

pub type Sink = &'static mut (dyn Write + Send);

struct Logger {
    sink: Mutex<Option<Sink>>,
}

static LOGGER: Logger = Logger {
    sink: Mutex::new(None),
};

fn level_color(level: Level) -> RGB8 {
    match level {
        Level::Error => RGB8::new(0xff, 0x55, 0x55),
        Level::Warn => RGB8::new(0xff, 0xcc, 0x00),
        Level::Info => RGB8::new(0x55, 0xdd, 0x55),
        Level::Debug => RGB8::new(0x55, 0x99, 0xff),
        Level::Trace => RGB8::new(0xaa, 0xaa, 0xaa),
    }
}

/// Writes one `[LEVEL target] message` line.
pub fn format_record(out: &mut dyn Write, record: &Record<'_>) -> fmt::Result {
    let level = record.level();
    writeln!(
        out,
        "[{} {}] {}",
        level.as_str().fg(level_color(level)),
        record.target(),
        record.args()
    )
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // The IRQ handler logs too.
        let flags = arch::local_irq_save();
        if let Some(sink) = self.sink.lock().as_mut() {
            let _ = format_record(&mut **sink, record);
        }
        arch::local_irq_restore(flags);
    }

    fn flush(&self) {}
}

/// Routes all log output to `sink`, dropping records above `level`.
pub fn init(sink: Sink, level: LevelFilter) -> KResult<()> {
    log::set_logger(&LOGGER).map_err(|_| kerr!(EBUSY, "a logger is already installed"))?;
    *LOGGER.sink.lock() = Some(sink);
    log::set_max_level(level);
    Ok(())
}

pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}
