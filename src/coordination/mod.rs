//! Coordination Layer for 24/7 Node Operation
//!
//! Shutdown plumbing shared by every pipeline task hosted on a node.

pub mod shutdown;

pub use shutdown::{
    install_signal_handlers, Shutdown, ShutdownConfig, ShutdownPhase, ShutdownSignal,
    ShutdownToken,
};
