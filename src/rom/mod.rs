pub mod features;
pub mod models;

pub use features::MonomialFeatures;
pub use models::{ReducedOrderModel, RomVariant};
