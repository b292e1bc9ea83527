mod partial;
mod retry;
mod task;

pub use partial::*;
pub use retry::*;
pub use task::*;
