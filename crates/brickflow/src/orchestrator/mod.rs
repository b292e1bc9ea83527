mod pool;
mod run;
mod state;
#[cfg(test)]
mod tests;

pub use run::*;
pub use state::*;
