//! Protocol definitions for proxy/client communication.
//!
//! - Frames: request/response envelopes and error replies
//! - Operations: the named storage requests and their payloads

pub mod frame;
pub mod operation;

pub use frame::{ErrorCode, ErrorReply, Frame, Reply, MAX_MESSAGE_SIZE};
pub use operation::{KeyIndex, Operation, CONNECT};
