// Slabpool - segregated-storage memory pool
// Fixed size classes served from bump-allocated blocks with intrusive free lists

#![warn(rust_2018_idioms)]

pub mod pool;

// Re-exports for convenience
pub use pool::{shared, BlockSource, PoolBox, SlabPool, SlotArena, SystemSource};

/// Pool error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Out of memory: {0}")]
        OutOfMemory(String),

        #[error("Invalid configuration: {0}")]
        Config(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_format() {
        // VERSION is a static string, always valid
        let _version: &str = VERSION;
        // Just ensure the constant is accessible
    }
}
