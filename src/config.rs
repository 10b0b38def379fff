//! Configuration for timelines, polling, chunk lists and synchronizers.
//!
//! Every struct has a `Default` and round-trips through JSON, so a whole
//! [`FeedDocConfig`] can be loaded from disk with [`FeedDocConfig::load`].

use std::path::Path;
use std::time::Duration;

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use crate::error::FeedError;
use crate::feed::MAX_FEED_PAYLOAD;
use crate::timeline::ChapterId;

/// Protocol name written into every chapter.
pub const TIMELINE_PROTOCOL: &str = "timeline";

/// Protocol version written into every chapter.
pub const TIMELINE_VERSION: &str = "1.0.0";

/// Settings shared by timeline readers and writers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineConfig {
    /// Protocol name chapters must carry.
    pub protocol: String,
    /// Version stamped on chapters this process writes.
    pub version: String,
    /// Semver requirement decoded chapters must satisfy.
    pub accepted_versions: String,
    /// Media type used when a chapter does not name one.
    pub media_type: String,
    /// Re-read the feed pointer before committing and abort on mismatch.
    pub check_conflicts: bool,
    /// Verify chapter signatures against their author on decode.
    pub verify_signatures: bool,
    /// Per-call timeout applied to store and register requests.
    pub request_timeout_ms: Option<u64>,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            protocol: TIMELINE_PROTOCOL.to_string(),
            version: TIMELINE_VERSION.to_string(),
            accepted_versions: "^1.0.0".to_string(),
            media_type: "application/json".to_string(),
            check_conflicts: true,
            verify_signatures: false,
            request_timeout_ms: None,
        }
    }
}

impl TimelineConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Parse `accepted_versions` into a requirement.
    pub fn version_req(&self) -> Result<VersionReq, FeedError> {
        VersionReq::parse(&self.accepted_versions).map_err(|e| {
            FeedError::Validation(format!(
                "invalid version requirement {:?}: {}",
                self.accepted_versions, e
            ))
        })
    }

    /// Check a decoded chapter's protocol and version.
    pub fn validate(&self, protocol: &str, version: &str) -> Result<(), FeedError> {
        if protocol != self.protocol {
            return Err(FeedError::Validation(format!(
                "unsupported protocol {:?}, expected {:?}",
                protocol, self.protocol
            )));
        }
        let parsed = Version::parse(version).map_err(|e| {
            FeedError::Validation(format!("invalid chapter version {:?}: {}", version, e))
        })?;
        if !self.version_req()?.matches(&parsed) {
            return Err(FeedError::Validation(format!(
                "unsupported version {}, accepted {}",
                parsed, self.accepted_versions
            )));
        }
        Ok(())
    }
}

/// Options for polling a feed's latest chapter.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PollOptions {
    /// Delay between polls.
    pub interval_ms: u64,
    /// Poll once right away instead of waiting a full interval.
    pub immediate: bool,
    /// Emit the latest chapter on every tick even when unchanged.
    pub always_emit: bool,
    /// Timeout for each poll request.
    pub timeout_ms: Option<u64>,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            immediate: true,
            always_emit: false,
            timeout_ms: None,
        }
    }
}

impl PollOptions {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn every(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            ..Default::default()
        }
    }
}

/// Options for a gap-filling live subscription.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveOptions {
    pub poll: PollOptions,
    /// The last chapter the subscriber already has.
    pub previous_id: Option<ChapterId>,
    /// With no `previous_id`, emit the whole chain on the first tick
    /// instead of only the latest chapter.
    pub backfill: bool,
}

/// Limits for chunk and data lists.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkListConfig {
    /// Largest raw chunk written straight to a feed epoch.
    pub max_chunk_size: usize,
    /// Largest payload a data list uploads to the content store.
    pub max_data_size: usize,
    /// Per-call timeout applied to store and register requests.
    pub request_timeout_ms: Option<u64>,
}

impl Default for ChunkListConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: MAX_FEED_PAYLOAD,
            max_data_size: 16 * 1024 * 1024,
            request_timeout_ms: None,
        }
    }
}

impl ChunkListConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

/// Cadence of a document synchronizer's background loops.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SynchronizerConfig {
    /// How often each source is pulled and merged.
    pub pull_interval_ms: u64,
    /// How often local edits are published; `None` disables auto-push.
    pub push_interval_ms: Option<u64>,
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self {
            pull_interval_ms: 10_000,
            push_interval_ms: Some(10_000),
        }
    }
}

impl SynchronizerConfig {
    pub fn pull_interval(&self) -> Duration {
        Duration::from_millis(self.pull_interval_ms)
    }

    pub fn push_interval(&self) -> Option<Duration> {
        self.push_interval_ms.map(Duration::from_millis)
    }
}

/// All settings in one file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedDocConfig {
    pub timeline: TimelineConfig,
    pub live: LiveOptions,
    pub chunks: ChunkListConfig,
    pub synchronizer: SynchronizerConfig,
}

impl FeedDocConfig {
    pub fn load(path: &Path) -> Result<Self, FeedError> {
        let data = std::fs::read(path).map_err(|e| {
            FeedError::Persistence(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_slice(&data)?;
        config.timeline.version_req()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), FeedError> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json).map_err(|e| {
            FeedError::Persistence(format!("Failed to write config {}: {}", path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_protocol_and_version() {
        let config = TimelineConfig::default();
        assert!(config.validate("timeline", "1.0.0").is_ok());
        assert!(config.validate("timeline", "1.4.2").is_ok());
        assert!(matches!(
            config.validate("timeline", "2.0.0"),
            Err(FeedError::Validation(_))
        ));
        assert!(matches!(
            config.validate("other", "1.0.0"),
            Err(FeedError::Validation(_))
        ));
        assert!(matches!(
            config.validate("timeline", "not-a-version"),
            Err(FeedError::Validation(_))
        ));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: FeedDocConfig =
            serde_json::from_str(r#"{"synchronizer": {"pull_interval_ms": 250}}"#).unwrap();
        assert_eq!(config.synchronizer.pull_interval_ms, 250);
        assert_eq!(config.synchronizer.push_interval_ms, Some(10_000));
        assert_eq!(config.timeline.protocol, TIMELINE_PROTOCOL);
        assert_eq!(config.chunks.max_chunk_size, MAX_FEED_PAYLOAD);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feeddoc.json");

        let mut config = FeedDocConfig::default();
        config.timeline.check_conflicts = false;
        config.live.poll.interval_ms = 500;
        config.save(&path).unwrap();

        let loaded = FeedDocConfig::load(&path).unwrap();
        assert!(!loaded.timeline.check_conflicts);
        assert_eq!(loaded.live.poll.interval_ms, 500);
    }

    #[test]
    fn test_load_rejects_bad_version_requirement() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"timeline": {"accepted_versions": "??"}}"#).unwrap();
        assert!(matches!(
            FeedDocConfig::load(&path),
            Err(FeedError::Validation(_))
        ));
    }
}
