//! REST route handlers.

pub mod connections;
pub mod health;
pub mod sessions;
