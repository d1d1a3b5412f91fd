pub mod commitment;
pub mod device;
pub mod quantity;
pub mod schedule;
pub mod series;
pub mod site;
pub mod time_grid;

pub use commitment::*;
pub use device::*;
pub use quantity::{Dimension, Quantity, QuantityValue};
pub use schedule::*;
pub use series::SeriesSpec;
pub use site::*;
pub use time_grid::*;
