//! Heuristic that decides whether a backend response carries a GTFS-RT feed.
//!
//! The rules are checked in a fixed order and the first hit wins:
//!
//! 1. `Content-Type` is exactly one of [`PROTOBUF_MEDIA_TYPES`]
//! 2. `Content-Type` contains [`OCTET_STREAM`]
//! 3. the request path contains one of [`FEED_PATH_KEYWORDS`]
//!
//! Only the presence of a [`Match`] matters to the filter. The variant is
//! carried along so logs can say why a response was picked up.

use std::fmt;

use reqwest::header::{CONTENT_TYPE, HeaderMap};

/// Media types that mark a body as protobuf.
pub const PROTOBUF_MEDIA_TYPES: [&str; 2] = ["application/x-protobuf", "application/protobuf"];

/// Substring of a generic binary `Content-Type`.
pub const OCTET_STREAM: &str = "octet-stream";

/// Case-sensitive substrings of a request path that point at a feed endpoint.
pub const FEED_PATH_KEYWORDS: [&str; 2] = ["gtfs", "tripupdates"];

/// The rule that classified a response as a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match {
    ProtobufMediaType(&'static str),
    OctetStream,
    PathKeyword(&'static str),
}

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Match::ProtobufMediaType(media_type) => write!(f, "content-type {media_type}"),
            Match::OctetStream => write!(f, "content-type contains {OCTET_STREAM}"),
            Match::PathKeyword(keyword) => write!(f, "path contains {keyword}"),
        }
    }
}

/// Classifies a response by its headers and the path of the request that
/// produced it. Returns `None` when the response does not look like a feed.
///
/// A missing or non-UTF-8 `Content-Type` is treated as empty.
pub fn classify(headers: &HeaderMap, path: &str) -> Option<Match> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if let Some(media_type) = PROTOBUF_MEDIA_TYPES
        .into_iter()
        .find(|media_type| content_type == *media_type)
    {
        return Some(Match::ProtobufMediaType(media_type));
    }

    if content_type.contains(OCTET_STREAM) {
        return Some(Match::OctetStream);
    }

    FEED_PATH_KEYWORDS
        .into_iter()
        .find(|keyword| path.contains(keyword))
        .map(Match::PathKeyword)
}
