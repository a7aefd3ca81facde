//! Platform wire protocol: topics and payloads

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
