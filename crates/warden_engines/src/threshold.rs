#![forbid(unsafe_code)]

use std::env;

use warden_kernel_contracts::bioverify::{MatchScore, PolicyClassification, SampleQuality};
use warden_kernel_contracts::{ContractViolation, Validate};

pub const SCORE_MIN_DEFAULT: f32 = 85.0;
pub const QUALITY_MIN_DEFAULT: f32 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdPolicyConfig {
    /// Inclusive floor on the verifier's similarity score.
    pub score_min: f32,
    /// Inclusive floor on sample quality. Checked before the score.
    pub quality_min: f32,
}

impl ThresholdPolicyConfig {
    pub fn mvp_v1() -> Self {
        Self {
            score_min: SCORE_MIN_DEFAULT,
            quality_min: QUALITY_MIN_DEFAULT,
        }
    }

    pub fn from_env() -> Self {
        Self::from_env_lookup(|key| env::var(key).ok())
    }

    pub fn from_env_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |key: &str, default: f32| {
            lookup(key)
                .and_then(|v| v.trim().parse::<f32>().ok())
                .filter(|v| v.is_finite() && (0.0..=100.0).contains(v))
                .unwrap_or(default)
        };
        Self {
            score_min: parse("WARDEN_SCORE_MIN", SCORE_MIN_DEFAULT),
            quality_min: parse("WARDEN_QUALITY_MIN", QUALITY_MIN_DEFAULT),
        }
    }
}

impl Validate for ThresholdPolicyConfig {
    fn validate(&self) -> Result<(), ContractViolation> {
        // Reuse the percent-range checks of the score types.
        MatchScore::new(self.score_min).map_err(|_| ContractViolation::InvalidRange {
            field: "threshold_policy_config.score_min",
            min: 0.0,
            max: 100.0,
            got: self.score_min as f64,
        })?;
        SampleQuality::new(self.quality_min).map_err(|_| ContractViolation::InvalidRange {
            field: "threshold_policy_config.quality_min",
            min: 0.0,
            max: 100.0,
            got: self.quality_min as f64,
        })?;
        Ok(())
    }
}

/// Maps a verifier result to a policy classification. No I/O, no clock, no randomness.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdPolicy {
    config: ThresholdPolicyConfig,
}

impl ThresholdPolicy {
    pub fn new(config: ThresholdPolicyConfig) -> Result<Self, ContractViolation> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ThresholdPolicyConfig {
        &self.config
    }

    pub fn classify(&self, score: MatchScore, quality: SampleQuality) -> PolicyClassification {
        // A low-quality capture makes the score meaningless, so quality gates first.
        if quality.value() < self.config.quality_min {
            return PolicyClassification::RejectLowQuality;
        }
        if score.value() < self.config.score_min {
            return PolicyClassification::RejectLowScore;
        }
        PolicyClassification::Accept
    }

    /// Untyped entry point; out-of-range or non-finite input is a caller bug and is refused.
    pub fn classify_raw(
        &self,
        score: f32,
        quality: f32,
    ) -> Result<PolicyClassification, ContractViolation> {
        Ok(self.classify(MatchScore::new(score)?, SampleQuality::new(quality)?))
    }
}
