//! Quality Gate Module
//!
//! Post-capture validation rejecting truncated or silent captures by their
//! byte rate over the claimed duration.

use serde::{Deserialize, Serialize};

/// Result of the byte-rate check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QualityGateResult {
    Accept {
        bytes_per_sec: f64,
    },
    Reject {
        bytes: u64,
        duration_secs: f64,
        bytes_per_sec: f64,
        min_bytes_per_sec: u64,
    },
}

/// Check a capture's bytes per second of claimed duration.
///
/// Returns `Reject` if `bytes / duration_secs < min_bytes_per_sec` or the
/// duration is not positive, otherwise `Accept`.
pub fn check_byte_rate(bytes: u64, duration_secs: f64, min_bytes_per_sec: u64) -> QualityGateResult {
    let bytes_per_sec = if duration_secs > 0.0 {
        bytes as f64 / duration_secs
    } else {
        0.0
    };

    if duration_secs <= 0.0 || bytes == 0 || bytes_per_sec < min_bytes_per_sec as f64 {
        QualityGateResult::Reject {
            bytes,
            duration_secs,
            bytes_per_sec,
            min_bytes_per_sec,
        }
    } else {
        QualityGateResult::Accept { bytes_per_sec }
    }
}

/// Whether the decoded duration covers enough of the claimed duration
pub fn duration_is_valid(decoded_secs: f64, claimed_secs: f64, min_ratio: f32) -> bool {
    decoded_secs > 0.0 && decoded_secs >= claimed_secs * min_ratio as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_scenario_rates() {
        // 45 MB over an hour is ~12.5 KB/s
        assert!(matches!(
            check_byte_rate(45_000_000, 3600.0, 2048),
            QualityGateResult::Accept { .. }
        ));
        // 8 KB over an hour is ~0.002 KB/s
        assert!(matches!(
            check_byte_rate(8_192, 3600.0, 2048),
            QualityGateResult::Reject { .. }
        ));
        assert!(matches!(
            check_byte_rate(1_000_000, 0.0, 2048),
            QualityGateResult::Reject { .. }
        ));
    }

    #[test]
    fn test_duration_ratio() {
        assert!(duration_is_valid(3600.0, 3600.0, 0.5));
        assert!(duration_is_valid(1800.0, 3600.0, 0.5));
        assert!(!duration_is_valid(1799.0, 3600.0, 0.5));
        assert!(!duration_is_valid(0.0, 0.0, 0.5));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_byte_rate_threshold(
            bytes in 0u64..1_000_000_000,
            duration in 1u32..20_000,
            min in 0u64..100_000,
        ) {
            let duration_secs = duration as f64;
            let rate = bytes as f64 / duration_secs;
            match check_byte_rate(bytes, duration_secs, min) {
                QualityGateResult::Accept { bytes_per_sec } => {
                    prop_assert!(bytes > 0);
                    prop_assert!(rate >= min as f64);
                    prop_assert!((bytes_per_sec - rate).abs() < 1e-6);
                }
                QualityGateResult::Reject { bytes: b, min_bytes_per_sec, .. } => {
                    prop_assert!(bytes == 0 || rate < min as f64);
                    prop_assert_eq!(b, bytes);
                    prop_assert_eq!(min_bytes_per_sec, min);
                }
            }
        }
    }
}
