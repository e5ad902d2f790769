pub mod fingerprint;
pub mod session;
pub mod source;

// Re-export common types
pub use session::BrowserPageSource;
pub use source::{HttpPageSource, PageSource};
