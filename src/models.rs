// Core data structures for cadence

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Social platform a content record targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Instagram,
    Facebook,
    Threads,
}

impl Platform {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instagram => "instagram",
            Self::Facebook => "facebook",
            Self::Threads => "threads",
        }
    }

    /// Parse from string (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "instagram" | "ig" => Some(Self::Instagram),
            "facebook" | "fb" => Some(Self::Facebook),
            "threads" => Some(Self::Threads),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Media type sent to the publisher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
    Carousel,
}

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "m4v", "webm"];

impl MediaType {
    /// Determine media type from the attached media references
    ///
    /// More than one reference is a carousel; otherwise the file
    /// extension decides between video and image.
    pub fn detect(media_refs: &[String]) -> Self {
        if media_refs.len() > 1 {
            return Self::Carousel;
        }

        let is_video = media_refs.first().is_some_and(|r| {
            let path = r.split(['?', '#']).next().unwrap_or(r);
            path.rsplit_once('.')
                .map(|(_, ext)| VIDEO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
                .unwrap_or(false)
        });

        if is_video {
            Self::Video
        } else {
            Self::Image
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Carousel => "carousel",
        }
    }
}

/// Lifecycle status of a scheduled content record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentStatus {
    /// Waiting for its publish time (or for a retry)
    Scheduled,
    /// Claimed by a worker or the fallback sweep, publish in progress
    Active,
    Published,
    Failed,
    Canceled,
}

impl ContentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Active => "active",
            Self::Published => "published",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(Self::Scheduled),
            "active" => Some(Self::Active),
            "published" => Some(Self::Published),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// No further transitions are allowed from a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Published | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for ContentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduled content record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub content_id: String,
    pub workspace_id: String,
    /// Account the content is published to
    pub account_id: String,
    pub platform: Platform,
    pub title: String,
    pub caption: String,
    pub media_refs: Vec<String>,
    pub scheduled_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub status: ContentStatus,
    pub external_post_id: Option<String>,
    /// Human-readable reason for the last failure
    pub failure_reason: Option<String>,
    /// When the current `Active` claim was taken
    pub claimed_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ContentRecord {
    /// Create a new record in `Scheduled` status
    pub fn new(
        content_id: impl Into<String>,
        workspace_id: impl Into<String>,
        account_id: impl Into<String>,
        platform: Platform,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            content_id: content_id.into(),
            workspace_id: workspace_id.into(),
            account_id: account_id.into(),
            platform,
            title: String::new(),
            caption: String::new(),
            media_refs: Vec::new(),
            scheduled_at,
            attempt_count: 0,
            status: ContentStatus::Scheduled,
            external_post_id: None,
            failure_reason: None,
            claimed_at: None,
            published_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = caption.into();
        self
    }

    pub fn with_media(mut self, media_ref: impl Into<String>) -> Self {
        self.media_refs.push(media_ref.into());
        self
    }

    /// Whether the record may still be published
    ///
    /// A record that carries an external post id is immutable, whatever
    /// its status says.
    pub fn is_publishable(&self) -> bool {
        self.status == ContentStatus::Scheduled && self.external_post_id.is_none()
    }

    /// Whether the record is due at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at <= now
    }

    pub fn media_type(&self) -> MediaType {
        MediaType::detect(&self.media_refs)
    }
}

/// Minimal account statistics returned by the platform
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AccountStats {
    pub follower_count: u64,
    pub media_count: u64,
    /// Aggregate engagement (likes + comments over recent media)
    pub engagement: f64,
}

/// Per-account polling state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    pub account_id: String,
    pub workspace_id: String,
    /// Opaque reference resolved to a credential by the content store
    pub credential_ref: String,
    pub last_known_follower_count: Option<u64>,
    pub last_known_media_count: Option<u64>,
    pub last_engagement_snapshot: Option<f64>,
    pub consecutive_no_change_count: u32,
    pub last_user_activity_at: Option<DateTime<Utc>>,
    pub last_polled_at: Option<DateTime<Utc>>,
}

impl PollingConfig {
    pub fn new(
        account_id: impl Into<String>,
        workspace_id: impl Into<String>,
        credential_ref: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            workspace_id: workspace_id.into(),
            credential_ref: credential_ref.into(),
            last_known_follower_count: None,
            last_known_media_count: None,
            last_engagement_snapshot: None,
            consecutive_no_change_count: 0,
            last_user_activity_at: None,
            last_polled_at: None,
        }
    }

    /// Check whether fresh stats differ from the stored values
    ///
    /// Counts compare exactly, engagement compares within `epsilon`. An
    /// account that has never been polled always counts as changed.
    pub fn differs_from(&self, stats: &AccountStats, epsilon: f64) -> bool {
        let followers_changed = self.last_known_follower_count != Some(stats.follower_count);
        let media_changed = self.last_known_media_count != Some(stats.media_count);
        let engagement_changed = match self.last_engagement_snapshot {
            Some(prev) => (prev - stats.engagement).abs() > epsilon,
            None => true,
        };

        followers_changed || media_changed || engagement_changed
    }

    /// Store fresh stats and reset the no-change streak
    pub fn apply_change(&mut self, stats: &AccountStats) {
        self.last_known_follower_count = Some(stats.follower_count);
        self.last_known_media_count = Some(stats.media_count);
        self.last_engagement_snapshot = Some(stats.engagement);
        self.consecutive_no_change_count = 0;
    }

    pub fn record_no_change(&mut self) {
        self.consecutive_no_change_count = self.consecutive_no_change_count.saturating_add(1);
    }
}

/// Daily analytics snapshot for an account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    pub account_id: String,
    pub workspace_id: String,
    pub date: NaiveDate,
    pub follower_count: u64,
    pub media_count: u64,
    pub engagement: f64,
    pub captured_at: DateTime<Utc>,
}

/// Platform credential resolved from a credential reference
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    pub account_id: String,
    pub access_token: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("account_id", &self.account_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_parse() {
        assert_eq!(Platform::parse("Instagram"), Some(Platform::Instagram));
        assert_eq!(Platform::parse("fb"), Some(Platform::Facebook));
        assert_eq!(Platform::parse("myspace"), None);
    }

    #[test]
    fn test_media_type_detection() {
        assert_eq!(
            MediaType::detect(&["https://cdn.example.com/a.jpg".to_string()]),
            MediaType::Image
        );
        assert_eq!(
            MediaType::detect(&["https://cdn.example.com/clip.MP4?sig=abc".to_string()]),
            MediaType::Video
        );
        assert_eq!(
            MediaType::detect(&["a.jpg".to_string(), "b.jpg".to_string()]),
            MediaType::Carousel
        );
        assert_eq!(MediaType::detect(&[]), MediaType::Image);
    }

    #[test]
    fn test_status_roundtrip_and_terminal() {
        for status in [
            ContentStatus::Scheduled,
            ContentStatus::Active,
            ContentStatus::Published,
            ContentStatus::Failed,
            ContentStatus::Canceled,
        ] {
            assert_eq!(ContentStatus::parse(status.as_str()), Some(status));
        }
        assert!(!ContentStatus::Scheduled.is_terminal());
        assert!(ContentStatus::Published.is_terminal());
    }

    #[test]
    fn test_publishable_requires_no_external_id() {
        let mut record =
            ContentRecord::new("c1", "w1", "acct", Platform::Instagram, Utc::now());
        assert!(record.is_publishable());

        record.external_post_id = Some("ext-1".to_string());
        assert!(!record.is_publishable());
    }

    #[test]
    fn test_polling_config_change_detection() {
        let mut config = PollingConfig::new("acct", "ws", "cred");
        let stats = AccountStats {
            follower_count: 100,
            media_count: 10,
            engagement: 42.0,
        };

        // Never polled counts as changed
        assert!(config.differs_from(&stats, 0.001));

        config.apply_change(&stats);
        assert!(!config.differs_from(&stats, 0.001));

        let nudged = AccountStats {
            engagement: 42.0005,
            ..stats
        };
        assert!(!config.differs_from(&nudged, 0.001));

        let more_followers = AccountStats {
            follower_count: 105,
            ..stats
        };
        assert!(config.differs_from(&more_followers, 0.001));
    }

    #[test]
    fn test_no_change_streak() {
        let mut config = PollingConfig::new("acct", "ws", "cred");
        config.record_no_change();
        config.record_no_change();
        assert_eq!(config.consecutive_no_change_count, 2);

        config.apply_change(&AccountStats::default());
        assert_eq!(config.consecutive_no_change_count, 0);
    }

    #[test]
    fn test_credential_debug_redacts_token() {
        let cred = Credential {
            account_id: "acct".to_string(),
            access_token: "secret-token".to_string(),
        };
        let debug = format!("{cred:?}");
        assert!(!debug.contains("secret-token"));
    }
}
