pub mod types;
pub mod error;
pub mod config;
pub mod selectors;
pub mod normalize;
pub mod structured;
pub mod fetch;
pub mod waterfall;
pub mod render;
pub mod generative;
pub mod pipeline;
pub mod telemetry;

// Re-export the public surface for embedding services
pub use config::ScrapeConfig;
pub use error::ScrapeError;
pub use pipeline::Scraper;
pub use types::*;
