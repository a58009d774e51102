use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Get current timestamp in milliseconds
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

// Clamp a signed change to an unsigned stat at zero
pub fn apply_signed(value: u32, delta: i32) -> u32 {
    (i64::from(value) + i64::from(delta)).clamp(0, i64::from(u32::MAX)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_is_after_2020() {
        assert!(timestamp_ms() > 1_577_836_800_000);
    }

    #[test]
    fn test_apply_signed_clamps() {
        assert_eq!(apply_signed(10, -10), 0);
        assert_eq!(apply_signed(10, -25), 0);
        assert_eq!(apply_signed(10, 15), 25);
        assert_eq!(apply_signed(u32::MAX, 1), u32::MAX);
    }
}
