//! Invocation and backedge counter encoding.
//!
//! A counter word keeps its count above [`COUNT_SHIFT`] so that generated
//! code can bump it by [`COUNT_INCREMENT`] and test the count bits with a
//! single mask. Bit 2 is the sticky carry: it is set the first time the
//! counter crosses its limit and survives resets, so a method that keeps
//! running hot is not reported as new on every crossing.

pub const COUNT_SHIFT: u32 = 3;
pub const CARRY_BIT: u32 = 1 << 2;
pub const COUNT_INCREMENT: u32 = 1 << COUNT_SHIFT;
pub const COUNT_MASK: u32 = !((1 << COUNT_SHIFT) - 1);
/// Largest representable count.
pub const COUNT_LIMIT: u32 = u32::MAX >> COUNT_SHIFT;

/// Count stored in a raw counter word.
pub fn count(raw: u32) -> u32 {
    raw >> COUNT_SHIFT
}

pub fn carry(raw: u32) -> bool {
    raw & CARRY_BIT != 0
}

/// Raw limit a masked counter is compared against.
pub fn limit(threshold: u32) -> u32 {
    threshold.min(COUNT_LIMIT) << COUNT_SHIFT
}

/// Mask a tiered counter is tested against: zero every `2^freq_log` events.
pub fn notify_mask(freq_log: u32) -> u32 {
    ((1u32 << freq_log) - 1) << COUNT_SHIFT
}

/// Counter word after an overflow has been handled: count cleared, carry set.
pub fn reset_with_carry(raw: u32) -> u32 {
    (raw & !COUNT_MASK) | CARRY_BIT
}

/// One increment, saturating instead of wrapping into the state bits.
pub fn increment(raw: u32) -> u32 {
    if count(raw) == COUNT_LIMIT {
        raw
    } else {
        raw + COUNT_INCREMENT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_and_mask() {
        let mut raw = 0;
        for _ in 0..5 {
            raw = increment(raw);
        }
        assert_eq!(count(raw), 5);
        assert_eq!(raw & COUNT_MASK, limit(5));
        assert!(!carry(raw));
    }

    #[test]
    fn test_reset_keeps_carry_sticky() {
        let raw = reset_with_carry(increment(0));
        assert_eq!(count(raw), 0);
        assert!(carry(raw));
        let raw = reset_with_carry(increment(raw));
        assert!(carry(raw));
    }

    #[test]
    fn test_notify_mask_fires_every_power_of_two() {
        let mask = notify_mask(3);
        let mut raw = 0u32;
        let mut fired = 0;
        for _ in 0..32 {
            raw = increment(raw);
            if raw & mask == 0 {
                fired += 1;
            }
        }
        assert_eq!(fired, 4);
    }

    #[test]
    fn test_saturation() {
        let raw = COUNT_LIMIT << COUNT_SHIFT;
        assert_eq!(increment(raw), raw);
    }
}
