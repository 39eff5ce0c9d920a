//! # StrataDB Tx-Op Codec
//!
//! Encodes a batch of transaction operations into the self-describing
//! columnar envelope that lives on the transaction log, and decodes it back.
//!
//! The envelope is a one-row Arrow IPC stream whose `tx-ops` column is a
//! list over a dense union of the eight operation variants. Documents
//! carried by `put-docs`/`patch-docs` are themselves a dense union keyed by
//! normalised table name, with legs created on first use.
//!
//! ## Normalisations applied at encode time
//!
//! - Table names become `schema/table` (default schema `public`); writes to
//!   system schemas are rejected.
//! - Simple `INSERT` statements submitted as SQL are rewritten to
//!   `put-docs` operations when the static optimiser recognises them.
//! - Every put/patch document must carry an `_id` field (located by
//!   case-normalised comparison); its 16-byte iid is computed in the same
//!   pass and written alongside the documents.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod decode;
pub mod envelope;
mod error;
pub mod op;
mod sql_rewrite;

pub use decode::{decode_record, read_envelope_batch, OpsCursor, TxEnvelope};
pub use envelope::{serialize, write_ops, TxOpsBuilder};
pub use error::CodecError;
pub use op::{normalize_table, Document, Iid, TxOp, TxOptions, Value, DEFAULT_SCHEMA};
