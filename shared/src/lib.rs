/// Shared types for relayfetch: errors, data model, settings, and the
/// yt-dlp request/event protocol.
pub mod config;
pub mod errors;
pub mod fetcher_protocol;
pub mod models;
pub mod naming;
