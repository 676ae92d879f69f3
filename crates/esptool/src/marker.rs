//! Success markers printed by esptool, one matcher per step kind.

use espbatch_core::normalize_mac;

const ERASE_DONE: &str = "Chip erase completed successfully";
const MAC_PREFIX: &str = "MAC: ";

pub fn erase_confirmed(line: &str) -> bool {
    line.contains(ERASE_DONE)
}

/// `Wrote 20576 bytes (12907 compressed) at 0x00008000 in 0.4 seconds ...`
pub fn write_confirmed(line: &str, offset: u32) -> bool {
    line.contains("Wrote") && line.contains(&format!("at 0x{:08x}", offset))
}

/// Extracts the MAC from a `MAC: aa:bb:cc:dd:ee:ff` line as 12 uppercase hex digits.
pub fn parse_mac_line(line: &str) -> Option<String> {
    let start = line.find(MAC_PREFIX)?;
    normalize_mac(&line[start + MAC_PREFIX.len()..])
}
