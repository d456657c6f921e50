//! Remote terminal usage modes
//!
//! An interactive duplex relay and a one-shot framed command executor, both
//! driven through [`SessionManager`].

pub mod exec;
pub mod relay;
pub mod session_manager;

pub use exec::FramedExec;
pub use relay::DuplexRelay;
pub use session_manager::{SessionConfig, SessionManager};
