//! Sequence number arithmetic.
//!
//! Connections track positions as 64-bit offsets from the initial sequence
//! number (the SYN sits at offset 0, the first data byte at offset 1) and
//! only convert to 32-bit wire values at the segment boundary.

/// Wire sequence number of `offset`.
pub fn to_wire(isn: u32, offset: u64) -> u32 {
    isn.wrapping_add(offset as u32)
}

/// Offset of wire value `wire`, resolved to the nearest offset around
/// `reference`. Values more than 2^31 away alias, as on a real wire.
pub fn to_offset(isn: u32, reference: u64, wire: u32) -> u64 {
    let reference_wire = to_wire(isn, reference);
    let delta = wire.wrapping_sub(reference_wire) as i32 as i64;
    (reference as i64 + delta).max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_near_reference() {
        let isn = 1_000;
        assert_eq!(to_offset(isn, 0, to_wire(isn, 0)), 0);
        assert_eq!(to_offset(isn, 500, to_wire(isn, 1_500)), 1_500);
        assert_eq!(to_offset(isn, 1_500, to_wire(isn, 500)), 500);
    }

    #[test]
    fn test_wraps_across_u32() {
        let isn = u32::MAX - 10;
        assert_eq!(to_wire(isn, 11), 0);
        assert_eq!(to_offset(isn, 5, 0), 11);
        assert_eq!(to_offset(isn, 5, u32::MAX), 10);
    }

    #[test]
    fn test_beyond_four_gigabytes() {
        let isn = 7;
        let offset = (1u64 << 32) + 1234;
        assert_eq!(to_offset(isn, offset - 100, to_wire(isn, offset)), offset);
    }

    #[test]
    fn test_never_negative() {
        assert_eq!(to_offset(100, 0, 50), 0);
    }
}
