//! Front-end side of the adapter: DAP framing and message types.

pub mod codec;
pub mod messages;

pub use codec::{DapCodec, DecodedRequest};
pub use messages::{Event, OutgoingMessage, Request, Response};
