//! RDMA device selection via the per-buffer priority matrix (§4.5.5),
//! restated per §9: `T = ordered list (preferred ++ fallback)`; the first
//! pick is random over the first non-empty half, later picks are
//! round-robin over `T`.

use mooncake_common::{MooncakeError, MooncakeResult, PriorityEntry};
use rand::Rng;

/// Selects a device index (into `entry.ordered()`) for the given
/// zero-based retry attempt.
///
/// `retry_count == 0`: uniformly random over the preferred devices if
/// any exist, else uniformly random over the fallback devices.
/// `retry_count > 0`: deterministic round-robin over the full ordered
/// list `T = preferred ++ fallback`.
pub fn select_device(entry: &PriorityEntry, retry_count: u32, rng: &mut impl Rng) -> MooncakeResult<usize> {
    let total = entry.total();
    if total == 0 {
        return Err(MooncakeError::DeviceNotFound(String::new()));
    }

    if retry_count == 0 {
        if !entry.preferred.is_empty() {
            return Ok(rng.gen_range(0..entry.preferred.len()));
        }
        let fallback_idx = rng.gen_range(0..entry.fallback.len());
        return Ok(entry.preferred.len() + fallback_idx);
    }

    Ok((retry_count as usize) % total)
}
