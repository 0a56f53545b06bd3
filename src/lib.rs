pub mod config;
pub mod error;
pub mod filter;
pub mod model;
pub mod pipeline;
pub mod transform;
pub mod warehouse;
