//! IPC codec and wire protocol — MessagePack framing shared by the
//! broker daemon, launched applications and the CLI client.

pub mod codec;
pub mod protocol;
