//! Reading and datapoint model shared by the south and north paths.

pub mod reading;
pub mod value;

pub use reading::{Reading, ReadingSet};
pub use value::{Datapoint, DatapointValue};
