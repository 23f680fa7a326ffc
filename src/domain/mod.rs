pub mod batch;
pub mod ids;
pub mod lease;
pub mod stage;
pub mod termination;

pub use batch::*;
pub use ids::*;
pub use lease::*;
pub use stage::*;
pub use termination::*;
