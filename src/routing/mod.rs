//! Message routing: next-hop resolution, recipient queues, multicast fan-out.

pub mod message_queue;
pub mod multicast;
pub mod router;
pub mod table;

pub use message_queue::MessageQueue;
pub use multicast::{matches_partitions, validate_fired_partitions, MulticastReceiverDirectory};
pub use router::{MessageRouter, MessagingStub, StubFactory};
pub use table::{RoutingEntry, RoutingTable};
