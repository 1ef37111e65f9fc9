//! Gateway façade and builder.

mod builder;
mod facade;

pub use builder::{GatewayBuilder, Mimir};
pub use facade::Gateway;
