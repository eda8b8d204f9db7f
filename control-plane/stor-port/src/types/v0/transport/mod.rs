mod misc;
mod replica;
mod system;

pub use misc::*;
pub use replica::*;
pub use system::*;
