//! Concrete [`Transport`](crate::application::transport::Transport)
//! implementations.
//!
//! - **`tcp`**       – TCP to `host:port`, e.g. a port forwarded to the
//!   device's debug bridge.
//! - **`stream`**    – The handle shared by every stream-based transport.
//! - **`simulated`** – An in-memory device for tests and `--simulate`.

pub mod simulated;
pub mod stream;
pub mod tcp;

pub use simulated::{SimStats, SimulatedDevice, SimulatedFleet};
pub use stream::StreamHandle;
pub use tcp::TcpTransport;
