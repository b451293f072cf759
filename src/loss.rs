//! Test-only loss injector: deterministic-seedable drop policies.
//!
//! State is scoped per connection, not process-global: concurrent
//! multi-peer tests never share burst state with each other.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const RANDOM_LOSS_PROB: f64 = 0.08;
const BURSTY_BASE_LOSS: f64 = 0.02;
const BURSTY_BURST_LOSS: f64 = 0.25;
const BURSTY_BURST_CHANCE: f64 = 0.10;
const BURSTY_MIN_LEN: u32 = 3;
const BURSTY_MAX_LEN: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LossProfile {
    #[default]
    Clean,
    Random,
    Bursty,
}

/// Consulted on every outbound transmission, including retransmissions
/// and control packets. Compiles to a no-op outside `test-util`/`test`.
#[derive(Debug)]
pub struct LossInjector {
    profile: LossProfile,
    rng: StdRng,
    burst_active: bool,
    burst_remaining: u32,
}

impl LossInjector {
    pub fn new(profile: LossProfile) -> Self {
        LossInjector {
            profile,
            rng: StdRng::from_entropy(),
            burst_active: false,
            burst_remaining: 0,
        }
    }

    pub fn seeded(profile: LossProfile, seed: u64) -> Self {
        LossInjector {
            profile,
            rng: StdRng::seed_from_u64(seed),
            burst_active: false,
            burst_remaining: 0,
        }
    }

    /// Returns `true` if the packet about to be transmitted should be
    /// silently dropped.
    #[cfg(any(test, feature = "test-util"))]
    pub fn should_drop(&mut self) -> bool {
        match self.profile {
            LossProfile::Clean => false,
            LossProfile::Random => self.rng.gen::<f64>() < RANDOM_LOSS_PROB,
            LossProfile::Bursty => self.bursty_should_drop(),
        }
    }

    #[cfg(not(any(test, feature = "test-util")))]
    pub fn should_drop(&mut self) -> bool {
        false
    }

    fn bursty_should_drop(&mut self) -> bool {
        let r: f64 = self.rng.gen();

        if self.burst_active {
            self.burst_remaining -= 1;
            if self.burst_remaining == 0 {
                self.burst_active = false;
            }
            return r < BURSTY_BURST_LOSS;
        }

        if r < BURSTY_BASE_LOSS {
            return true;
        }

        if r < BURSTY_BURST_CHANCE {
            self.burst_active = true;
            self.burst_remaining = self.rng.gen_range(BURSTY_MIN_LEN..=BURSTY_MAX_LEN);
            return r < BURSTY_BURST_LOSS;
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_never_drops() {
        let mut inj = LossInjector::seeded(LossProfile::Clean, 1);
        for _ in 0..1000 {
            assert!(!inj.should_drop());
        }
    }

    #[test]
    fn random_drops_some_but_not_all() {
        let mut inj = LossInjector::seeded(LossProfile::Random, 42);
        let dropped = (0..2000).filter(|_| inj.should_drop()).count();
        assert!(dropped > 0 && dropped < 2000);
    }

    #[test]
    fn independent_instances_do_not_share_burst_state() {
        let mut a = LossInjector::seeded(LossProfile::Bursty, 7);
        let mut b = LossInjector::seeded(LossProfile::Bursty, 7);
        for _ in 0..50 {
            assert_eq!(a.should_drop(), b.should_drop());
        }
    }
}
