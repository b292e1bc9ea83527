mod components;
mod identity;
mod interface;

pub use components::*;
pub use identity::*;
pub use interface::*;
