pub mod config;
pub mod detection;
pub mod frame;
pub mod geometry;
pub mod homography;
pub mod minimap;
pub mod pipeline;
pub mod remote;
pub mod rendering;
pub mod table;
pub mod tracking;

// Re-export the top-level pipeline error type so callers only need `tabletrack_core::Error`
pub use anyhow::Error;
pub use anyhow::Result;
