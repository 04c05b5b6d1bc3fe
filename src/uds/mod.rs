//! Unix-domain-socket transport.
//!
//! Wire format (version 1): every frame is a 4-byte ASCII magic cookie,
//! a 4-byte big-endian body length, and the body. `MJI1` frames carry the
//! connecting client's address descriptor and appear exactly once, first,
//! per connection; `MJM1` frames carry one serialized message each.
//!
//! [`client::UdsClient`] dials the cluster controller and announces itself
//! with an init frame; [`server::UdsServer`] accepts connections, captures
//! peer credentials, and hands out per-connection sender handles.

pub mod client;
pub mod framing;
pub mod send_queue;
pub mod server;

pub use client::{UdsClient, UdsClientEvent};
pub use framing::{FrameDecoder, UdsFrame};
pub use send_queue::{SendFailed, UdsSendQueue};
pub use server::{UdsSenderHandle, UdsServer, UdsServerEvent};
