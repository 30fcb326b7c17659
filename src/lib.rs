pub mod config;
pub mod diagnostics;
pub mod error;
pub mod generate;
pub mod model;
pub mod pipeline;
pub mod repair;
pub mod report;
pub mod sandbox;
pub mod store;

pub use error::ForgeError;
