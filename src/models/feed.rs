use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Feed variants published by the upstream provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeedType {
    Anonymous,
    AnonymousIpv6,
    AnonymousResidential,
    AnonymousResidentialIpv6,
    #[serde(rename = "ipsummary")]
    IpSummary,
}

impl FeedType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedType::Anonymous => "anonymous",
            FeedType::AnonymousIpv6 => "anonymous-ipv6",
            FeedType::AnonymousResidential => "anonymous-residential",
            FeedType::AnonymousResidentialIpv6 => "anonymous-residential-ipv6",
            FeedType::IpSummary => "ipsummary",
        }
    }

    /// The IPv6 network companion of this feed, if the provider publishes one.
    pub fn ipv6_companion(&self) -> Option<FeedType> {
        match self {
            FeedType::Anonymous => Some(FeedType::AnonymousIpv6),
            FeedType::AnonymousResidential => Some(FeedType::AnonymousResidentialIpv6),
            _ => None,
        }
    }
}

impl fmt::Display for FeedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown feed type '{0}'")]
pub struct UnknownFeedType(pub String);

impl FromStr for FeedType {
    type Err = UnknownFeedType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "anonymous" => Ok(FeedType::Anonymous),
            "anonymous-ipv6" => Ok(FeedType::AnonymousIpv6),
            "anonymous-residential" => Ok(FeedType::AnonymousResidential),
            "anonymous-residential-ipv6" => Ok(FeedType::AnonymousResidentialIpv6),
            "ipsummary" => Ok(FeedType::IpSummary),
            other => Err(UnknownFeedType(other.to_string())),
        }
    }
}

/// Marker for the most recent full snapshot of a feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotWatermark {
    #[serde(default)]
    pub location: String,
    /// Snapshot day formatted as `YYYYMMDD`
    #[serde(default)]
    pub date: String,
    pub generated_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
}

/// Marker for the most recent realtime (incremental) file of a feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeWatermark {
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub location: String,
}

/// Wire wrapper used by the provider's metadata endpoints: `{"json": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedInfoEnvelope<T> {
    pub json: T,
}
