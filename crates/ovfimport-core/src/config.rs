//! Per-invocation import configuration.

use std::time::Duration;

use crate::manifest::ManifestPolicy;

/// Entity name used when neither the options nor the descriptor name one.
pub const DEFAULT_ENTITY_NAME: &str = "Virtual Appliance";

/// Locale sent with import spec requests and written to the OVF environment.
pub const DEFAULT_LOCALE: &str = "US";

/// Default listener throttle, about ten reports per second.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Default interval between lease keep-alive progress reports.
pub const DEFAULT_LEASE_UPDATE_INTERVAL: Duration = Duration::from_secs(2);

/// Bounded exponential backoff for download preparation polling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    /// Delay before the second poll.
    pub initial_interval: Duration,
    /// Upper bound on the delay between polls.
    pub max_interval: Duration,
    /// Growth factor applied after every poll.
    pub multiplier: f64,
    /// Total time to wait before giving up.
    pub max_wait: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(10),
            multiplier: 2.0,
            max_wait: Duration::from_secs(10 * 60),
        }
    }
}

impl PollPolicy {
    /// Create a fixed-interval policy.
    pub fn fixed(interval: Duration, max_wait: Duration) -> Self {
        Self {
            initial_interval: interval,
            max_interval: interval,
            multiplier: 1.0,
            max_wait,
        }
    }

    /// The delay that follows `current`.
    pub fn next_interval(&self, current: Duration) -> Duration {
        let next = current.mul_f64(self.multiplier.max(1.0));
        next.min(self.max_interval)
    }
}

/// Settings for one import invocation.
///
/// Everything the pipeline needs is passed in here; nothing is read from
/// process-wide state.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Compare server checksums against the package manifest.
    pub verify_manifest: bool,
    /// What to do when verification is on but the manifest is missing.
    pub manifest_policy: ManifestPolicy,
    /// Offer and accept overrides of non-configurable properties.
    pub hidden: bool,
    pub locale: String,
    pub default_name: String,
    /// Minimum gap between listener callbacks for one file.
    pub progress_interval: Duration,
    /// Gap between lease keep-alive reports.
    pub lease_update_interval: Duration,
    pub poll: PollPolicy,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            verify_manifest: false,
            manifest_policy: ManifestPolicy::Warn,
            hidden: false,
            locale: DEFAULT_LOCALE.to_string(),
            default_name: DEFAULT_ENTITY_NAME.to_string(),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            lease_update_interval: DEFAULT_LEASE_UPDATE_INTERVAL,
            poll: PollPolicy::default(),
        }
    }
}

impl ImportConfig {
    /// Verify checksums; a missing manifest is only a warning.
    pub fn verified() -> Self {
        Self {
            verify_manifest: true,
            ..Self::default()
        }
    }

    /// Verify checksums and refuse packages without a manifest.
    pub fn strict() -> Self {
        Self {
            verify_manifest: true,
            manifest_policy: ManifestPolicy::Require,
            ..Self::default()
        }
    }
}
