//! Bundled driver adapters.

#[cfg(feature = "postgres")]
pub mod postgres;
