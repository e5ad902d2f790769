pub mod error;
pub mod fetcher;
pub mod pacer;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod task;

// Re-export common types
pub use fetcher::PageFetcher;
pub use retry::RetryingFetcher;
pub use runner::BatchRunner;
