//! The HTTP surface and process wiring of tradutor.
//!
//! The `tradutor` binary built from this crate runs either the translation API, a translation
//! worker, or a small command line client which submits text and waits for the result.
pub mod cli;
pub mod config;
pub mod gemini;
pub mod handlers;
pub mod http_client;
pub mod router;
pub mod state;
pub mod telemetry;

pub use router::create_router;
pub use state::AppState;
