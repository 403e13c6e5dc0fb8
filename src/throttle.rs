//! Admission control over concurrent login attempts.
//!
//! The `MaxStartups` triple works like the sshd option of the same name:
//! unconditional admission up to `begin` in-flight attempts, unconditional
//! rejection above `max`, and a linearly increasing drop probability
//! (starting at `rate` percent) in between.

use rand::Rng;

pub const DEFAULT_BEGIN: u32 = 10;
pub const DEFAULT_RATE: u32 = 100;
pub const DEFAULT_MAX: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxStartups {
    pub begin: u32,
    pub rate: u32,
    pub max: u32,
}

impl Default for MaxStartups {
    fn default() -> Self {
        Self {
            begin: DEFAULT_BEGIN,
            rate: DEFAULT_RATE,
            max: DEFAULT_MAX,
        }
    }
}

impl MaxStartups {
    /// Parse a `"begin:rate:max"` spec. One value sets `begin = max` with
    /// full rate; two values set `max` from `begin`. Anything illegal
    /// reverts the whole triple to defaults with a warning.
    pub fn parse(spec: &str) -> Self {
        let parts: Vec<&str> = spec.split(':').collect();
        let parsed = match parts.as_slice() {
            [b] => b.trim().parse().ok().map(|b| (b, DEFAULT_RATE, b)),
            [b, r] => match (b.trim().parse(), r.trim().parse()) {
                (Ok(b), Ok(r)) => Some((b, r, b)),
                _ => None,
            },
            [b, r, m] => match (b.trim().parse(), r.trim().parse(), m.trim().parse()) {
                (Ok(b), Ok(r), Ok(m)) => Some((b, r, m)),
                _ => None,
            },
            _ => None,
        };
        match parsed {
            Some((begin, rate, max)) if begin <= max && (1..=100).contains(&rate) => {
                Self { begin, rate, max }
            }
            _ => {
                tracing::warn!(spec, "invalid MaxStartups, using defaults");
                Self::default()
            }
        }
    }

    /// Decide whether to drop a new attempt. `active` is the number of
    /// attempts already in flight (not counting this one); `draw` is
    /// uniform in `[0, 100)`.
    pub fn should_drop(&self, active: u32, draw: u32) -> bool {
        if self.max == 0 || active + 1 <= self.begin {
            return false;
        }
        if active + 1 > self.max {
            return true;
        }
        // begin < active + 1 <= max implies begin < max here
        let p = self.rate + (100 - self.rate) * (active - self.begin) / (self.max - self.begin);
        draw < p
    }

    /// `should_drop` with a fresh random draw.
    pub fn decide(&self, active: u32) -> bool {
        self.should_drop(active, rand::thread_rng().gen_range(0..100))
    }
}
