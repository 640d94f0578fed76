// src/connectors/mod.rs

// 1. HTTP connector for the dataspace management API
pub mod edc;

// 2. In-memory dataspace (offline snapshots, tests)
pub mod memory;

// 3. Management API credential providers
pub mod token;

pub use edc::EdcConnector;
pub use memory::{MemoryDataspace, PayloadFixture};
pub use token::{NoAuth, StaticToken};
