//! Two-tier chat routing: an Upstream Chat Bridge preferred over a
//! synchronous HTTP fallback, plus memory tag processing and context
//! injection shared by both paths.

pub mod bridge;
pub mod context;
pub mod error;
pub mod fallback;
pub mod memory_tags;

pub use bridge::{BridgeEvent, UpstreamChatBridge};
pub use error::{Error, Result};
