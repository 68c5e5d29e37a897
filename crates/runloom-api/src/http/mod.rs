//! REST API under `/api/v1/`, with envelope responses.

pub mod error;
pub mod handlers;
pub mod response;
pub mod router;
