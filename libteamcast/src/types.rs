//! Core types shared by adapters, entities and the orchestrator

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Social platforms an account can be connected to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitter,
    Facebook,
    LinkedIn,
    Instagram,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::Twitter,
        Platform::Facebook,
        Platform::LinkedIn,
        Platform::Instagram,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Twitter => "twitter",
            Platform::Facebook => "facebook",
            Platform::LinkedIn => "linkedin",
            Platform::Instagram => "instagram",
        }
    }

    /// Published limits for each platform
    pub fn capabilities(&self) -> Capabilities {
        match self {
            Platform::Twitter => Capabilities {
                max_text_length: 280,
                max_media_count: 4,
                supported_media_types: &[
                    MediaMimeType::Jpeg,
                    MediaMimeType::Png,
                    MediaMimeType::Gif,
                    MediaMimeType::WebP,
                    MediaMimeType::Mp4,
                ],
                media_required: false,
                supports_editing: false,
                supports_scheduling: false,
                supports_threads: true,
                supports_analytics: true,
            },
            Platform::Facebook => Capabilities {
                max_text_length: 63_206,
                max_media_count: 10,
                supported_media_types: &[
                    MediaMimeType::Jpeg,
                    MediaMimeType::Png,
                    MediaMimeType::Gif,
                    MediaMimeType::Mp4,
                ],
                media_required: false,
                supports_editing: true,
                supports_scheduling: true,
                supports_threads: false,
                supports_analytics: true,
            },
            Platform::LinkedIn => Capabilities {
                max_text_length: 3_000,
                max_media_count: 9,
                supported_media_types: &[
                    MediaMimeType::Jpeg,
                    MediaMimeType::Png,
                    MediaMimeType::Gif,
                    MediaMimeType::Mp4,
                ],
                media_required: false,
                supports_editing: true,
                supports_scheduling: false,
                supports_threads: false,
                supports_analytics: true,
            },
            Platform::Instagram => Capabilities {
                max_text_length: 2_200,
                max_media_count: 10,
                supported_media_types: &[MediaMimeType::Jpeg, MediaMimeType::Mp4],
                media_required: true,
                supports_editing: false,
                supports_scheduling: false,
                supports_threads: false,
                supports_analytics: true,
            },
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "twitter" | "x" => Ok(Platform::Twitter),
            "facebook" => Ok(Platform::Facebook),
            "linkedin" => Ok(Platform::LinkedIn),
            "instagram" => Ok(Platform::Instagram),
            other => Err(ValidationError::UnknownPlatform(other.to_string())),
        }
    }
}

/// Media types recognised from attachment URLs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MediaMimeType {
    Jpeg,
    Png,
    Gif,
    WebP,
    Mp4,
}

impl MediaMimeType {
    /// Detect MIME type from file extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "gif" => Some(Self::Gif),
            "webp" => Some(Self::WebP),
            "mp4" => Some(Self::Mp4),
            _ => None,
        }
    }

    /// Detect MIME type from the last path segment of a media URL
    ///
    /// Returns `None` when the URL carries no recognisable extension, e.g. CDN
    /// links without one.
    pub fn from_url(url: &str) -> Option<Self> {
        let path = url.split(|c: char| c == '?' || c == '#').next().unwrap_or(url);
        let segment = path.rsplit('/').next().unwrap_or(path);
        let (_, ext) = segment.rsplit_once('.')?;
        Self::from_extension(ext)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::WebP => "image/webp",
            Self::Mp4 => "video/mp4",
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, Self::Mp4)
    }
}

impl fmt::Display for MediaMimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static capability declaration of a platform adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub max_text_length: usize,
    pub max_media_count: usize,
    pub supported_media_types: &'static [MediaMimeType],
    pub media_required: bool,
    pub supports_editing: bool,
    pub supports_scheduling: bool,
    pub supports_threads: bool,
    pub supports_analytics: bool,
}

impl Capabilities {
    /// Pre-flight check run before any network call is made
    pub fn check(&self, platform: Platform, content: &Content) -> Result<(), ValidationError> {
        let length = content.char_count();
        if length > self.max_text_length {
            return Err(ValidationError::ContentTooLong {
                platform: platform.to_string(),
                max: self.max_text_length,
                actual: length,
            });
        }

        if content.media_urls.len() > self.max_media_count {
            return Err(ValidationError::TooManyMedia {
                platform: platform.to_string(),
                max: self.max_media_count,
                actual: content.media_urls.len(),
            });
        }

        if self.media_required && content.media_urls.is_empty() {
            return Err(ValidationError::MediaRequired {
                platform: platform.to_string(),
            });
        }

        for url in &content.media_urls {
            if let Some(media_type) = MediaMimeType::from_url(url) {
                if !self.supported_media_types.contains(&media_type) {
                    return Err(ValidationError::UnsupportedMediaType {
                        platform: platform.to_string(),
                        media_type: media_type.to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Text plus attached media URLs
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Content {
    pub text: String,
    #[serde(default)]
    pub media_urls: Vec<String>,
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            media_urls: Vec::new(),
        }
    }

    pub fn with_media(mut self, url: impl Into<String>) -> Self {
        self.media_urls.push(url.into());
        self
    }

    /// Length in Unicode scalar values, which is how platforms count characters
    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Outcome of a successful publish call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResult {
    pub platform_post_id: String,
    pub url: String,
    pub published_at: DateTime<Utc>,
}

/// Engagement metrics for one published post
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analytics {
    pub impressions: u64,
    pub likes: u64,
    pub comments: u64,
    pub shares: u64,
    pub clicks: u64,
    pub engagements: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    #[default]
    Personal,
    Page,
    Business,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Personal => "personal",
            AccountType::Page => "page",
            AccountType::Business => "business",
        }
    }
}

impl FromStr for AccountType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "personal" => Ok(AccountType::Personal),
            "page" => Ok(AccountType::Page),
            "business" => Ok(AccountType::Business),
            other => Err(ValidationError::Invalid(format!("unknown account type: {other}"))),
        }
    }
}

/// Public profile of a connected identity
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProfileInfo {
    pub username: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub profile_url: Option<String>,
    pub account_type: AccountType,
}

/// Remaining quota reported by a platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateLimitStatus {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub resets_at: Option<DateTime<Utc>>,
}

impl RateLimitStatus {
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == Some(0)
    }
}
