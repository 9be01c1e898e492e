//! Flat text exposition.
//!
//! One line per reading: `<key> <value> <time>\n`, with the value as a
//! fixed-point decimal. No `# HELP`/`# TYPE` metadata and no ordering
//! guarantee; lines follow the store's iteration order.

use std::fmt::{self, Write};

use podstats_core::Reading;

/// Append a single exposition line for `reading`.
fn write_reading(out: &mut String, reading: &Reading) -> fmt::Result {
    writeln!(out, "{} {:.6} {}", reading.key, reading.value, reading.time)
}

/// Render a sequence of readings into exposition text.
pub fn render_readings<'a>(readings: impl IntoIterator<Item = &'a Reading>) -> Result<String, fmt::Error> {
    let mut out = String::new();
    for reading in readings {
        write_reading(&mut out, reading)?;
    }
    Ok(out)
}
