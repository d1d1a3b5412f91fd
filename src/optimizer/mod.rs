pub mod backend;
pub mod constraints;
pub mod driver;
pub mod objective;
pub mod types;

pub use backend::*;
pub use constraints::*;
pub use driver::*;
pub use objective::*;
pub use types::*;
