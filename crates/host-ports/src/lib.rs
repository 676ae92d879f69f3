//! Serial port discovery for the host platform.
//!
//! Every candidate is opened and closed again to prove it is usable, so this
//! must never run while a flashing step holds one of the ports.

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::debug;

const PROBE_BAUD: u32 = 115_200;
const PROBE_TIMEOUT: Duration = Duration::from_millis(50);

/// Currently connected ports that can be opened, in a stable order.
pub fn list_serial_ports() -> Result<Vec<String>> {
    let candidates = serialport::available_ports()
        .context("enumerating serial ports")?
        .into_iter()
        .map(|info| info.port_name)
        .collect();
    Ok(filter_openable(candidates, is_openable))
}

pub fn filter_openable<F>(candidates: Vec<String>, mut probe: F) -> Vec<String>
where
    F: FnMut(&str) -> bool,
{
    let mut ports: Vec<String> = candidates
        .into_iter()
        .filter(|port| {
            let usable = probe(port);
            debug!(port = %port, usable, "probed serial port");
            usable
        })
        .collect();
    ports.sort_by(|a, b| natural_key(a).cmp(&natural_key(b)));
    ports.dedup();
    ports
}

/// Opens the port and drops it right away.
pub fn is_openable(port: &str) -> bool {
    match serialport::new(port, PROBE_BAUD).timeout(PROBE_TIMEOUT).open() {
        Ok(handle) => {
            drop(handle);
            true
        }
        Err(err) => {
            debug!(port, error = %err, "port not openable");
            false
        }
    }
}

/// Sorts `COM10` after `COM9` and `/dev/ttyUSB10` after `/dev/ttyUSB2`.
fn natural_key(port: &str) -> (String, u64) {
    let split = port
        .rfind(|ch: char| !ch.is_ascii_digit())
        .map(|pos| pos + 1)
        .unwrap_or(0);
    let (stem, digits) = port.split_at(split);
    (stem.to_string(), digits.parse().unwrap_or(0))
}
