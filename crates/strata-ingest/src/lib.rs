//! # StrataDB Ingestion
//!
//! The single consumer of the transaction log. A [`LogProcessor`]
//! subscribes to the log, decodes each transaction record, applies it to
//! the [`Indexer`] strictly in offset order, and releases awaiters through
//! the [`WatchRegistry`]. A [`Flusher`] watches for indexing idleness and
//! injects `FlushChunk` control messages back through the log so chunk
//! boundaries stay globally ordered with transactions.
//!
//! [`Ingester`] wires the pieces together and adds the client-facing
//! submit path.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod error;
pub mod flusher;
mod indexer;
mod ingester;
pub mod processor;
pub mod watch;

pub use error::IngestError;
pub use flusher::Flusher;
pub use indexer::{Indexer, TrieCatalog, TxDescriptor};
pub use ingester::Ingester;
pub use processor::{IngestConfig, LogProcessor};
pub use watch::WatchRegistry;
