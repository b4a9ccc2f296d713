//! File-backed sources and sinks.

pub mod compression;
pub mod quarantine;
pub mod source;
pub mod sqlite;

#[cfg_attr(docsrs, doc(cfg(feature = "io-parquet")))]
#[cfg(feature = "io-parquet")]
pub mod parquet;
