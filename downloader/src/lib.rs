/// Relayfetch download engine
///
/// Stall-aware HTTP transfers plus on-demand materialization of the external
/// binaries the pipeline needs (tor, ffmpeg, 7-Zip).
pub mod archive;
pub mod listing;
pub mod materializer;
pub mod platform;
pub mod transfer;

#[cfg(test)]
mod test_support;

pub use materializer::{Dependency, Materializer, ProxyBinarySource, ProxyBundle};
pub use platform::Platform;
pub use transfer::{Transfer, TransferEvent};
