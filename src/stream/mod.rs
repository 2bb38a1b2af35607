//! Subscription stream modules.
//!
//! - `client`: connection state machine, idle watchdog and resume cursor.
//! - `framing`: chunk to frame re-assembly and `data:` decoding.
//! - `proto`: notification payloads carried by the stream.

/// Stream reader and its spawned handle.
pub mod client;
/// Incremental frame decoder.
pub mod framing;
/// Stream protocol messages.
pub mod proto;
