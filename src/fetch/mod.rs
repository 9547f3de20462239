mod client;
mod feed;

pub use client::{BasicClient, HttpClient};
pub use feed::{FeedClient, decode_feed};
