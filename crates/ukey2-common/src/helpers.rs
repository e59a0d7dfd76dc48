//! Common helper functions for UKEY2.

/// Performs a constant-time comparison of two byte strings.
///
/// The handshake compares key commitments with this. Lengths are not
/// secret and are compared first.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (lhs, rhs) in a.iter().zip(b.iter()) {
        diff |= lhs ^ rhs;
    }
    diff == 0
}
