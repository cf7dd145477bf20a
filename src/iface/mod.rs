//! Network interface layer
//!
//! - Packet channel to the TUN device
//! - Connection table keyed by 4-tuple
//! - Interface dispatch and application requests
//! - The event loop driving all of it

pub mod device;
pub mod event_loop;
pub mod interface;
pub mod table;

// Re-export commonly used items
pub use device::{MemoryChannel, PacketChannel};
pub use event_loop::{Event, EventLoop};
pub use interface::{NetworkInterface, Stats};
pub use table::ConnectionTable;
