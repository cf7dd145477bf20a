//! Transport layer
//!
//! TCP only: the segment codec, sequence arithmetic, RTT estimation, the
//! timer scheduler and the per-connection state machine.

pub mod connection;
pub mod rtt;
pub mod seq;
pub mod tcp;
pub mod timer;

// Re-export commonly used items
pub use connection::{CloseReason, Connection, ConnectionId, Quad, TcpState, TimerOutcome};
pub use tcp::{Segment, TcpFlags, TcpHeader, TcpOption};
pub use timer::{TimerEntry, TimerKind, TimerScheduler};
