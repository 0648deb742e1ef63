mod fingerprint;
mod post;
mod source;

pub use fingerprint::Fingerprint;
pub use post::DiscoveredPost;
pub use source::FeedSource;
