//! Mainstem election: one active coordinator per pipeline

pub mod config;
pub mod listener;
pub mod monitor;

pub use config::ElectionConfig;
pub use listener::{ListenerHandle, ListenerRegistry, MainstemListener};
pub use monitor::MainstemMonitor;
