//! Controller/worker messaging: a long-lived named channel with reconnect
//! handling, plus a one-shot path that answers through the same dispatcher.

pub mod controller;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod worker;

pub use controller::Controller;
pub use dispatch::Dispatcher;
pub use protocol::{Request, Response};
pub use transport::Hub;
pub use worker::Worker;
