pub mod access;
pub mod adapter;
pub mod cache;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod executor;
pub mod harvest;
pub mod logging;
pub mod model;
pub mod store;
pub mod thredds;
pub mod traits;
pub mod tree;

// Re-export common types for convenience
pub use access::PermissionResolver;
pub use config::CatalogConfig;
pub use error::{CatalogError, Result};
pub use executor::*;
pub use model::*;
pub use store::MemoryStore;
pub use traits::*;
pub use tree::EntryTree;
