//! Cross-cutting utilities: OCPP-J framing, shutdown coordination, timers.

pub mod ocpp_frame;
pub mod shutdown;
pub mod timer;

pub use ocpp_frame::{OcppFrame, OcppFrameError, RpcErrorCode};
pub use shutdown::ShutdownSignal;
pub use timer::{OwnedTimer, RepeatingTimer};
