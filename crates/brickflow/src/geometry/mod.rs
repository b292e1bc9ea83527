mod bounds;
mod face;
mod grid;

pub use bounds::*;
pub use face::*;
pub use grid::*;
