mod contact;
mod remap;
mod stitcher;
mod union_find;

pub use contact::*;
pub use remap::*;
pub use stitcher::*;
pub use union_find::*;
