pub mod cache;
pub mod region_file;

pub use cache::*;
pub use region_file::*;
