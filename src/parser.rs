//! Protobuf decoding of GTFS Realtime feeds.

use anyhow::Result;
use chrono::{DateTime, Utc};
use prost::Message;

use crate::gtfs_rt::FeedMessage;
use crate::schema::check_required;

/// Decodes a protobuf-encoded GTFS-RT [`FeedMessage`] from raw bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not valid protobuf for a `FeedMessage`,
/// or if any message in the feed is missing a `required` field.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedMessage> {
    let feed = FeedMessage::decode(bytes)?;
    check_required(bytes)?;
    Ok(feed)
}

/// Creation time of the feed from its header, if the producer set one.
pub fn feed_timestamp(feed: &FeedMessage) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(feed.header.timestamp?).ok()?;
    DateTime::from_timestamp(secs, 0)
}
