//! Stdio bridge to the Etch debug server.
//!
//! This module provides the wire protocol and codec for communication between
//! the adapter and the debuggee subprocess.
//!
//! # Architecture
//!
//! - **protocol**: Message types (OutgoingRequest, IncomingMessage)
//! - **codec**: Line-delimited JSON framing for AsyncRead/AsyncWrite
//! - **writer**: Sequence-stamping request writer for the debuggee's stdin

pub mod codec;
pub mod protocol;
pub mod writer;
