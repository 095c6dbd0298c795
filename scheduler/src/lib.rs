//! Job scheduling utilities built on top of tokio.

/// `ShutdownSignal`, the daemon-wide shutdown channel.
pub mod shutdown;
/// The timer wheel: run tasks at (or after) a scheduled instant.
pub mod wheel;

pub use shutdown::ShutdownSignal;
pub use wheel::TimerWheel;
