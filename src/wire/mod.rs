//! Wire protocol: frame header, message bodies, and the async codec that
//! ties them together over a `tokio::net::TcpStream` (spec §6).

pub mod codec;
pub mod header;
pub mod message;

pub use codec::{read_message, write_message};
pub use header::FrameHeader;
pub use message::{Message, MessageKind};
