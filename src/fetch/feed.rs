//! GTFS-RT vehicle position feed client: fetch and protobuf decode.

use anyhow::{Context, Result};
use gtfs_realtime::FeedMessage;
use prost::Message;
use tracing::debug;

use super::client::HttpClient;

/// Fetches and decodes the configured vehicle positions endpoint.
pub struct FeedClient<C: HttpClient> {
    client: C,
    url: String,
}

impl<C: HttpClient> FeedClient<C> {
    pub fn new(client: C, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    /// One fetch + decode round. Any failure (network, HTTP status,
    /// protobuf) surfaces as an error; the caller skips the cycle.
    pub async fn fetch_feed(&self) -> Result<FeedMessage> {
        let req = reqwest::Request::new(reqwest::Method::GET, self.url.parse()?);

        let resp = self
            .client
            .execute(req)
            .await
            .with_context(|| format!("feed request failed: {}", self.url))?;
        let resp = resp.error_for_status()?;

        let bytes = resp.bytes().await?;
        debug!(bytes = bytes.len(), "Feed bytes received, decoding");

        decode_feed(bytes.as_ref()).context("feed protobuf decode failed")
    }
}

/// Decodes a protobuf-encoded [`FeedMessage`] from raw bytes.
pub fn decode_feed(bytes: &[u8]) -> Result<FeedMessage> {
    Ok(FeedMessage::decode(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_empty_bytes_is_default_feed() {
        // Empty input is valid protobuf for a default message
        let feed = decode_feed(&[]).unwrap();
        assert_eq!(feed.header.gtfs_realtime_version, "");
        assert!(feed.entity.is_empty());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(decode_feed(&[0xFF, 0xFE, 0x00, 0x01]).is_err());
    }

    #[test]
    fn test_decode_round_trip() {
        let feed = FeedMessage {
            header: gtfs_realtime::FeedHeader {
                gtfs_realtime_version: "2.0".to_string(),
                incrementality: None,
                timestamp: Some(1_765_100_000),
                feed_version: None,
            },
            entity: vec![],
        };
        let encoded = feed.encode_to_vec();
        let decoded = decode_feed(&encoded).unwrap();
        assert_eq!(decoded.header.gtfs_realtime_version, "2.0");
        assert_eq!(decoded.header.timestamp, Some(1_765_100_000));
    }
}
