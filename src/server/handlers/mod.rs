pub mod breakers;
pub mod failures;
pub mod recovery;
pub mod system;

pub use breakers::*;
pub use failures::*;
pub use recovery::*;
pub use system::*;
