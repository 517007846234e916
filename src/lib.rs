pub mod clock;
pub mod config;
pub mod error;
pub mod model;
pub mod node;
pub mod reclaim;
pub mod registry;
pub mod shutdown;
pub mod store;
pub mod worker;
