pub mod app;
pub mod config;
pub mod handler;
pub mod jobs;
pub mod llm;
pub mod session;
pub mod store;
pub mod tools;

use std::future::Future;

/// Single seam for background task spawning so instrumentation can be added
/// in one place.
pub fn spawn<F>(future: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(future)
}
