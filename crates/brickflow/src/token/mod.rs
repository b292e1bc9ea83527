mod config;
mod interface;
mod lease;
mod local;
#[cfg(test)]
mod tests;

pub use config::*;
pub use interface::*;
pub use lease::*;
pub use local::*;
