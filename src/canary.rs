//! Percentage-based canary backend selection
//!
//! A binding with a non-zero `percent` shifts traffic to its flow service by
//! listing a prefix of the flow service's backends ahead of the main ones.

/// Number of candidates to take for a canary share of `percent`.
///
/// At least one candidate is taken whenever any traffic is requested and more
/// than one candidate exists, and the full list is never taken: `end` is always
/// below `len` for a non-empty list, even at 100%.
pub fn canary_end(len: usize, percent: i64) -> usize {
    if len == 0 || percent <= 0 {
        return 0;
    }

    let mut p = len as f64 * (percent.min(100) as f64 / 100.0);
    if p < 1.0 && len > 1 {
        p = 1.0;
    }

    let mut end = p.round() as usize;
    if end >= len {
        end -= 1;
    }
    end
}

/// The canary prefix of `candidates`, in original order
pub fn select_canary(candidates: &[String], percent: i64) -> &[String] {
    &candidates[..canary_end(candidates.len(), percent)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("    server node-{}:30080;", i)).collect()
    }

    #[test]
    fn test_half_of_ten() {
        assert_eq!(canary_end(10, 50), 5);
    }

    #[test]
    fn test_small_share_clamps_to_one() {
        // 2 * 0.10 = 0.2 -> 1
        assert_eq!(canary_end(2, 10), 1);
        assert_eq!(canary_end(10, 1), 1);
    }

    #[test]
    fn test_single_candidate_is_never_selected() {
        // 1 * 0.5 rounds to 1, which is the whole list, so one is given back
        assert_eq!(canary_end(1, 50), 0);
        assert_eq!(canary_end(1, 100), 0);
        // below one with a single candidate there is no clamp
        assert_eq!(canary_end(1, 10), 0);
    }

    #[test]
    fn test_full_share_keeps_one_candidate_back() {
        assert_eq!(canary_end(10, 100), 9);
        assert_eq!(canary_end(3, 100), 2);
        assert_eq!(canary_end(2, 100), 1);
    }

    #[test]
    fn test_rounding_to_nearest() {
        // 3 * 0.5 = 1.5 -> 2
        assert_eq!(canary_end(3, 50), 2);
        // 7 * 0.3 = 2.1 -> 2
        assert_eq!(canary_end(7, 30), 2);
        // 10 * 0.95 = 9.5 -> 10 -> 9
        assert_eq!(canary_end(10, 95), 9);
    }

    #[test]
    fn test_empty_and_zero() {
        assert_eq!(canary_end(0, 50), 0);
        assert_eq!(canary_end(5, 0), 0);
    }

    #[test]
    fn test_bounds_hold_for_every_share() {
        for len in 1..=25 {
            for percent in 1..=100 {
                let end = canary_end(len, percent);
                assert!(end <= len - 1, "len={} percent={} end={}", len, percent, end);
                if len > 1 {
                    assert!(end >= 1, "len={} percent={} end={}", len, percent, end);
                }
            }
        }
    }

    #[test]
    fn test_select_thirty_percent_of_ten() {
        let list = candidates(10);
        let selected = select_canary(&list, 30);
        assert_eq!(selected, &list[..3]);
    }

    #[test]
    fn test_percent_above_hundred_is_capped() {
        assert_eq!(canary_end(4, 250), 3);
    }
}
