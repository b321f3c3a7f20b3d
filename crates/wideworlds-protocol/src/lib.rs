pub mod codec;
pub mod hash;
pub mod messages;
pub mod prop;

pub use codec::*;
pub use hash::*;
pub use messages::*;
pub use prop::*;
