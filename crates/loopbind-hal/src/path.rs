/// Device path for a loop slot, e.g. `/dev/loop` + 3 -> `/dev/loop3`.
pub fn loop_device_path(prefix: &str, slot: u32) -> String {
    format!("{}{}", prefix, slot)
}

/// Inverse of [`loop_device_path`]. Returns `None` when `device` does not
/// belong to the namespace rooted at `prefix`.
pub fn slot_from_path(prefix: &str, device: &str) -> Option<u32> {
    let index = device.strip_prefix(prefix)?;
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    index.parse().ok()
}
