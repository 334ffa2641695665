use rand::{Rng, RngCore};

/// Delay before resend attempt `attempts + 1` of an unacknowledged action.
///
/// Exponential growth from `base_ms`, capped at `cap_ms`, with "equal
/// jitter": the returned delay is in `[d/2, d]` so simultaneous retries
/// from many items do not land on the same instant.
pub(crate) fn retry_delay(rng: &mut impl RngCore, attempts: u32, base_ms: u64, cap_ms: u64) -> u64 {
    let exp = attempts.min(16);
    let raw = base_ms.saturating_mul(1u64 << exp);
    let capped = raw.clamp(1, cap_ms.max(1));
    if capped <= 1 {
        return capped;
    }

    let half = capped / 2;
    let jitter = rng.gen_range(0..=half);
    half.saturating_add(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn delay_grows_then_caps() {
        let mut rng = StdRng::seed_from_u64(7);
        for attempts in 0..10 {
            let delay = retry_delay(&mut rng, attempts, 500, 5_000);
            let expected = (500u64 << attempts.min(16)).min(5_000);
            assert!(delay >= expected / 2 && delay <= expected, "attempt {attempts}: {delay}");
        }
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let mut rng = StdRng::seed_from_u64(7);
        let delay = retry_delay(&mut rng, u32::MAX, 500, 5_000);
        assert!(delay <= 5_000);
    }
}
