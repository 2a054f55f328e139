//! Control plane of a robot cloud: a single master leasing addresses to
//! satellites, satellites hosting containers for their robots and meshing
//! with each other to route between them.

pub mod address;
pub mod comm;
pub mod config;
pub mod error;
pub mod lease;
pub mod master;
pub mod message;
pub mod runtime;
pub mod satellite;
pub mod store;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
