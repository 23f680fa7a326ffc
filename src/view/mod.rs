//! Read-only projections of coordination state

pub mod progress;

pub use progress::{ProgressView, SourceCursor};
