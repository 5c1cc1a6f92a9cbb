//! Fast cache configuration.

use std::num::NonZeroUsize;
use std::time::Duration;

const DEFAULT_CAPACITY: usize = 10_000;
const DEFAULT_POSITIVE_TTL: Duration = Duration::from_secs(300);
const DEFAULT_NEGATIVE_TTL: Duration = Duration::from_secs(60);
/// Ceiling applied to every entry, including ones stored without a TTL.
pub const MAX_ENTRY_TTL: Duration = Duration::from_secs(48 * 60 * 60);

#[derive(Debug, Clone)]
pub struct FastCacheConfig {
    /// Disable to send every lookup to the index.
    pub enabled: bool,
    /// Maximum entries held before LRU eviction.
    pub capacity: usize,
    /// Lifetime of a resolved identity.
    pub positive_ttl: Duration,
    /// Lifetime of a remembered miss.
    pub negative_ttl: Duration,
    pub max_ttl: Duration,
}

impl Default for FastCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: DEFAULT_CAPACITY,
            positive_ttl: DEFAULT_POSITIVE_TTL,
            negative_ttl: DEFAULT_NEGATIVE_TTL,
            max_ttl: MAX_ENTRY_TTL,
        }
    }
}

impl From<&crate::config::CacheSettings> for FastCacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            capacity: settings.capacity.get(),
            positive_ttl: settings.positive_ttl,
            negative_ttl: settings.negative_ttl,
            max_ttl: settings.max_ttl,
        }
    }
}

impl FastCacheConfig {
    /// Returns the capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.capacity).unwrap_or(NonZeroUsize::MIN)
    }

    /// Clamp a requested TTL to the configured ceiling; `None` means the ceiling itself.
    pub fn effective_ttl(&self, requested: Option<Duration>) -> Duration {
        requested.map_or(self.max_ttl, |ttl| ttl.min(self.max_ttl))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = FastCacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.capacity, 10_000);
        assert_eq!(config.positive_ttl, Duration::from_secs(300));
        assert_eq!(config.negative_ttl, Duration::from_secs(60));
        assert_eq!(config.max_ttl, Duration::from_secs(172_800));
    }

    #[test]
    fn ttl_is_capped_at_ceiling() {
        let config = FastCacheConfig::default();
        assert_eq!(config.effective_ttl(None), MAX_ENTRY_TTL);
        assert_eq!(
            config.effective_ttl(Some(Duration::from_secs(7 * 24 * 3600))),
            MAX_ENTRY_TTL
        );
        assert_eq!(
            config.effective_ttl(Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = FastCacheConfig {
            capacity: 0,
            ..Default::default()
        };
        assert_eq!(config.capacity_non_zero().get(), 1);
    }
}
