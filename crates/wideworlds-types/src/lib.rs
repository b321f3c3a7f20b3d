pub mod types;
pub mod world;

pub use types::*;
pub use world::*;
