//! Zero-page detection.
//!
//! Saving skips pages that are entirely zero and loading reconstructs them
//! by zero-fill, so both paths funnel through this one check. The scan
//! compares 16-byte lanes, which the compiler lowers to SIMD compares on
//! every target we care about; the tail of a non-lane-multiple page is
//! checked bytewise.

const LANE: usize = 16;
const ZERO_LANE: [u8; LANE] = [0; LANE];

/// Returns `true` when every byte of `buf` is zero.
#[inline]
pub fn is_zero_page(buf: &[u8]) -> bool {
    let mut lanes = buf.chunks_exact(LANE);
    for lane in lanes.by_ref() {
        if lane != ZERO_LANE.as_slice() {
            return false;
        }
    }
    lanes.remainder().iter().all(|&b| b == 0)
}

/// Zero-fills `dst` unless it is already zero.
///
/// Returns `true` if a write was performed. Skipping the write matters on
/// the load path: freshly mapped guest memory is zero already, and writing
/// zeros over it would dirty pages the OS could otherwise share.
pub fn fill_zero(dst: &mut [u8]) -> bool {
    if is_zero_page(dst) {
        return false;
    }
    dst.fill(0);
    true
}
