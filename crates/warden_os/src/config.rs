#![forbid(unsafe_code)]

use std::env;
use std::time::Duration;

use warden_engines::approval::ApprovalWorkflowConfig;

pub const VERIFY_MAX_RETRIES_DEFAULT: u8 = 2;
pub const VERIFY_RETRY_BACKOFF_MS_DEFAULT: u64 = 250;
pub const STALE_VERIFICATION_MS_DEFAULT: u64 = 120_000;
/// Slack on top of the worst-case cycle for the commit phase.
pub const STALE_COMMIT_MARGIN_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowConfig {
    pub auto_approve: bool,
    /// Retries after the first attempt, transport failures only.
    pub max_transport_retries: u8,
    /// Delay before the first retry; doubled for each retry after that.
    pub retry_backoff_ms: u64,
    pub stale_verification_ms: u64,
}

impl WorkflowConfig {
    pub fn mvp_v1() -> Self {
        Self {
            auto_approve: false,
            max_transport_retries: VERIFY_MAX_RETRIES_DEFAULT,
            retry_backoff_ms: VERIFY_RETRY_BACKOFF_MS_DEFAULT,
            stale_verification_ms: STALE_VERIFICATION_MS_DEFAULT,
        }
    }

    pub fn from_env() -> Self {
        Self::from_env_lookup(|key| env::var(key).ok())
    }

    pub fn from_env_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let auto_approve = match lookup("WARDEN_AUTO_APPROVE") {
            Some(v) => matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "on" | "yes"
            ),
            None => false,
        };
        let max_transport_retries = lookup("WARDEN_VERIFY_MAX_RETRIES")
            .and_then(|v| v.trim().parse::<u8>().ok())
            .filter(|v| (0..=5).contains(v))
            .unwrap_or(VERIFY_MAX_RETRIES_DEFAULT);
        let retry_backoff_ms = lookup("WARDEN_VERIFY_RETRY_BACKOFF_MS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|v| (0..=10_000).contains(v))
            .unwrap_or(VERIFY_RETRY_BACKOFF_MS_DEFAULT);
        let stale_verification_ms = lookup("WARDEN_STALE_VERIFICATION_MS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|v| (1_000..=86_400_000).contains(v))
            .unwrap_or(STALE_VERIFICATION_MS_DEFAULT);
        Self {
            auto_approve,
            max_transport_retries,
            retry_backoff_ms,
            stale_verification_ms,
        }
    }

    pub fn approval_workflow_config(&self) -> ApprovalWorkflowConfig {
        ApprovalWorkflowConfig {
            auto_approve: self.auto_approve,
        }
    }

    /// Sleep before retry number `retry` (1-based).
    pub fn backoff_for_retry(&self, retry: u8) -> Duration {
        let shift = u32::from(retry.saturating_sub(1)).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(1_u64 << shift))
    }

    pub fn stale_after_ns(&self) -> u64 {
        self.stale_verification_ms.saturating_mul(1_000_000)
    }

    /// Longest a cycle can stay in flight: every permitted attempt running to `call_timeout`,
    /// plus the backoff between attempts.
    pub fn worst_case_cycle(&self, call_timeout: Duration) -> Duration {
        let attempts = u32::from(self.max_transport_retries) + 1;
        let backoff: Duration = (1..=self.max_transport_retries)
            .map(|retry| self.backoff_for_retry(retry))
            .sum();
        call_timeout.saturating_mul(attempts).saturating_add(backoff)
    }

    /// The configured stale window, raised so a cycle that is still running is never
    /// reported stale.
    pub fn effective_stale_after_ns(&self, call_timeout: Duration) -> u64 {
        let floor = self
            .worst_case_cycle(call_timeout)
            .saturating_add(Duration::from_millis(STALE_COMMIT_MARGIN_MS));
        let floor_ns = u64::try_from(floor.as_nanos()).unwrap_or(u64::MAX);
        self.stale_after_ns().max(floor_ns)
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self::mvp_v1()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn at_config_01_defaults() {
        let cfg = WorkflowConfig::from_env_lookup(|_| None);
        assert_eq!(cfg, WorkflowConfig::mvp_v1());
        assert!(!cfg.auto_approve);
        assert_eq!(cfg.max_transport_retries, 2);
    }

    #[test]
    fn at_config_02_out_of_range_values_fall_back() {
        let mut vars = BTreeMap::new();
        vars.insert("WARDEN_AUTO_APPROVE", "TRUE");
        vars.insert("WARDEN_VERIFY_MAX_RETRIES", "9");
        vars.insert("WARDEN_VERIFY_RETRY_BACKOFF_MS", "0");
        vars.insert("WARDEN_STALE_VERIFICATION_MS", "nope");
        let cfg = WorkflowConfig::from_env_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert!(cfg.auto_approve);
        assert_eq!(cfg.max_transport_retries, VERIFY_MAX_RETRIES_DEFAULT);
        assert_eq!(cfg.retry_backoff_ms, 0);
        assert_eq!(cfg.stale_verification_ms, STALE_VERIFICATION_MS_DEFAULT);
    }

    #[test]
    fn at_config_03_backoff_doubles() {
        let cfg = WorkflowConfig::mvp_v1();
        assert_eq!(cfg.backoff_for_retry(1), Duration::from_millis(250));
        assert_eq!(cfg.backoff_for_retry(2), Duration::from_millis(500));
        assert_eq!(cfg.backoff_for_retry(3), Duration::from_millis(1_000));
    }

    #[test]
    fn at_config_04_stale_window_never_below_worst_case_cycle() {
        let cfg = WorkflowConfig {
            stale_verification_ms: 1_000,
            ..WorkflowConfig::mvp_v1()
        };
        // 3 attempts x 13s plus 250ms + 500ms of backoff.
        let call = Duration::from_millis(13_000);
        assert_eq!(cfg.worst_case_cycle(call), Duration::from_millis(39_750));
        assert_eq!(cfg.effective_stale_after_ns(call), 40_750 * 1_000_000);

        let roomy = WorkflowConfig::mvp_v1();
        assert_eq!(
            roomy.effective_stale_after_ns(call),
            STALE_VERIFICATION_MS_DEFAULT * 1_000_000
        );
        assert_eq!(
            cfg.effective_stale_after_ns(Duration::ZERO),
            (750 + STALE_COMMIT_MARGIN_MS) * 1_000_000
        );
    }
}
