//! The resonance matching seam.
//!
//! One predicate decides whether an incoming resonance is dispatched to
//! extensions. The default only thresholds on strength; richer matchers
//! (hierarchical intents, vector similarity) replace the trait object at
//! orchestrator construction without touching the pipeline.

/// Policy deciding whether a resonance advertisement resonates locally.
pub trait ResonanceMatcher: Send + Sync {
    fn resonates(&self, intent: &str, strength: f64) -> bool;
}

/// Default policy: accept any resonance with `strength` strictly above the
/// threshold, ignoring the intent string.
#[derive(Debug, Clone, Copy)]
pub struct StrengthThreshold(pub f64);

impl Default for StrengthThreshold {
    fn default() -> Self {
        StrengthThreshold(0.5)
    }
}

impl ResonanceMatcher for StrengthThreshold {
    fn resonates(&self, _intent: &str, strength: f64) -> bool {
        strength > self.0
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0.4, false)]
    #[case(0.5, false)] // strictly above
    #[case(0.51, true)]
    #[case(0.9, true)]
    fn default_threshold(#[case] strength: f64, #[case] expected: bool) {
        let matcher = StrengthThreshold::default();
        assert_eq!(matcher.resonates("anything", strength), expected);
    }

    #[test]
    fn intent_is_ignored_by_default() {
        let matcher = StrengthThreshold::default();
        assert_eq!(
            matcher.resonates("mining:coord", 0.9),
            matcher.resonates("file:sync", 0.9)
        );
    }
}
