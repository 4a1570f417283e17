pub mod handler;
pub mod rest;
pub mod webhook;

pub use handler::{housekeeping_router, session_router};
pub use rest::rest_router;
pub use webhook::webhook_router;
