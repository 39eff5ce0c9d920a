//! Transaction operation model.
//!
//! [`TxOp`] is the tagged union written into the envelope's `tx-ops`
//! column. Documents are ordered field maps over a small scalar [`Value`]
//! set; identities are 16-byte [`Iid`] hashes of the `_id` value.

use chrono::{DateTime, Utc};
use xxhash_rust::xxh3::xxh3_128;

use crate::error::CodecError;

/// Schema applied to bare table names.
pub const DEFAULT_SCHEMA: &str = "public";

/// The one system table that accepts user writes.
pub const TX_FNS_TABLE: &str = "xt/tx_fns";

const FORBIDDEN_PREFIXES: [&str; 3] = ["xt/", "information_schema/", "pg_catalog/"];

/// Normalises a table name to `schema/table` form and rejects writes to
/// system schemas.
///
/// Bare names get the default schema: `users` becomes `public/users`.
/// Names already carrying a schema are kept as-is.
///
/// # Errors
///
/// Returns [`CodecError::ForbiddenTable`] for tables under `xt/`,
/// `information_schema/` or `pg_catalog/`, except the literal
/// [`TX_FNS_TABLE`].
pub fn normalize_table(name: &str) -> Result<String, CodecError> {
    let normalized = if name.contains('/') {
        name.to_string()
    } else {
        format!("{DEFAULT_SCHEMA}/{name}")
    };

    if normalized != TX_FNS_TABLE
        && FORBIDDEN_PREFIXES
            .iter()
            .any(|p| normalized.starts_with(p))
    {
        return Err(CodecError::ForbiddenTable(normalized));
    }
    Ok(normalized)
}

/// A scalar document or parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit integer.
    Int64(i64),
    /// 64-bit float.
    Float64(f64),
    /// UTF-8 text.
    Utf8(String),
    /// Opaque bytes.
    Binary(Vec<u8>),
    /// Instant (stored as microseconds, UTC).
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Canonical byte form used for iid hashing: a tag byte followed by the
    /// value's little-endian payload.
    fn canonical_bytes(&self) -> Vec<u8> {
        match self {
            Self::Null => vec![0],
            Self::Bool(b) => vec![1, u8::from(*b)],
            Self::Int64(v) => {
                let mut out = vec![2];
                out.extend_from_slice(&v.to_le_bytes());
                out
            }
            Self::Float64(v) => {
                let mut out = vec![3];
                out.extend_from_slice(&v.to_bits().to_le_bytes());
                out
            }
            Self::Utf8(s) => {
                let mut out = vec![4];
                out.extend_from_slice(s.as_bytes());
                out
            }
            Self::Binary(b) => {
                let mut out = vec![5];
                out.extend_from_slice(b);
                out
            }
            Self::Timestamp(t) => {
                let mut out = vec![6];
                out.extend_from_slice(&t.timestamp_micros().to_le_bytes());
                out
            }
        }
    }
}

/// 16-byte deterministic identity hash of a document's `_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Iid(pub [u8; 16]);

impl Iid {
    /// Computes the iid for an `_id` value.
    #[must_use]
    pub fn for_id(id: &Value) -> Self {
        Self(xxh3_128(&id.canonical_bytes()).to_be_bytes())
    }

    /// The raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

/// An ordered field map: one document row of a put/patch operation.
///
/// Field order is preserved; it drives the order of struct columns on the
/// wire.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document(Vec<(String, Value)>);

impl Document {
    /// Creates an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field, builder style.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.insert(name, value);
        self
    }

    /// Appends a field.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.0.push((name.into(), value));
    }

    /// Iterates fields in insertion order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Looks up a field by exact name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Locates the `_id` field with one case-normalised key walk.
    #[must_use]
    pub fn id(&self) -> Option<&Value> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("_id"))
            .map(|(_, v)| v)
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the document has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A single transaction operation.
#[derive(Debug, Clone, PartialEq)]
pub enum TxOp {
    /// A SQL statement with zero or more parameter rows.
    Sql {
        /// The statement text.
        query: String,
        /// Parameter rows; all rows must have equal arity.
        arg_rows: Vec<Vec<Value>>,
    },
    /// An opaque serialised query form with optional parameter blob.
    Xtql {
        /// Serialised query form.
        op: Vec<u8>,
        /// Optional parameter blob.
        args: Option<Vec<u8>>,
    },
    /// Upsert documents into a table.
    PutDocs {
        /// Target table (normalised at encode time).
        table: String,
        /// Document rows; each must carry `_id`.
        docs: Vec<Document>,
        /// Start of the validity range.
        valid_from: Option<DateTime<Utc>>,
        /// End of the validity range.
        valid_to: Option<DateTime<Utc>>,
    },
    /// Patch documents in a table.
    PatchDocs {
        /// Target table (normalised at encode time).
        table: String,
        /// Patch document rows; each must carry `_id`.
        docs: Vec<Document>,
        /// Start of the validity range.
        valid_from: Option<DateTime<Utc>>,
        /// End of the validity range.
        valid_to: Option<DateTime<Utc>>,
    },
    /// Delete documents over a validity range.
    DeleteDocs {
        /// Target table (normalised at encode time).
        table: String,
        /// Identities to delete.
        iids: Vec<Iid>,
        /// Start of the validity range.
        valid_from: Option<DateTime<Utc>>,
        /// End of the validity range.
        valid_to: Option<DateTime<Utc>>,
    },
    /// Erase documents entirely (no validity range).
    EraseDocs {
        /// Target table (normalised at encode time).
        table: String,
        /// Identities to erase.
        iids: Vec<Iid>,
    },
    /// Invoke a stored transaction function.
    Call {
        /// Identity of the function document.
        fn_iid: Iid,
        /// Opaque serialised argument form.
        args: Vec<u8>,
    },
    /// Abort the transaction.
    Abort,
}

impl TxOp {
    /// Convenience constructor for a parameterless SQL op.
    #[must_use]
    pub fn sql(query: impl Into<String>) -> Self {
        Self::Sql {
            query: query.into(),
            arg_rows: Vec::new(),
        }
    }

    /// Convenience constructor for a SQL op with parameter rows.
    #[must_use]
    pub fn sql_with_args(query: impl Into<String>, arg_rows: Vec<Vec<Value>>) -> Self {
        Self::Sql {
            query: query.into(),
            arg_rows,
        }
    }

    /// Convenience constructor for a put without a validity range.
    #[must_use]
    pub fn put_docs(table: impl Into<String>, docs: Vec<Document>) -> Self {
        Self::PutDocs {
            table: table.into(),
            docs,
            valid_from: None,
            valid_to: None,
        }
    }
}

/// Envelope-level options for one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TxOptions {
    /// Forced logical commit time, when present.
    pub system_time: Option<DateTime<Utc>>,
    /// IANA zone applied to operations that interpret bare timestamps.
    pub default_tz: String,
    /// Authenticated principal, if any.
    pub user: Option<String>,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            system_time: None,
            default_tz: "UTC".to_string(),
            user: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_bare_table() {
        assert_eq!(normalize_table("users").unwrap(), "public/users");
    }

    #[test]
    fn test_normalize_keeps_schema() {
        assert_eq!(normalize_table("crm/users").unwrap(), "crm/users");
    }

    #[test]
    fn test_forbidden_tables() {
        for name in ["xt/txs", "information_schema/x", "pg_catalog/pg_am"] {
            assert!(matches!(
                normalize_table(name),
                Err(CodecError::ForbiddenTable(_))
            ));
        }
    }

    #[test]
    fn test_tx_fns_table_is_allowed() {
        assert_eq!(normalize_table("xt/tx_fns").unwrap(), "xt/tx_fns");
    }

    #[test]
    fn test_bare_system_names_get_default_schema() {
        // Only explicit schema prefixes are forbidden.
        assert_eq!(
            normalize_table("information_schema").unwrap(),
            "public/information_schema"
        );
    }

    #[test]
    fn test_document_id_lookup_is_case_normalised() {
        let doc = Document::new().with_field("_ID", Value::Utf8("a".into()));
        assert_eq!(doc.id(), Some(&Value::Utf8("a".into())));
        assert!(Document::new()
            .with_field("name", Value::Utf8("a".into()))
            .id()
            .is_none());
    }

    #[test]
    fn test_iid_deterministic_and_distinct() {
        let a1 = Iid::for_id(&Value::Utf8("a".into()));
        let a2 = Iid::for_id(&Value::Utf8("a".into()));
        let b = Iid::for_id(&Value::Utf8("b".into()));
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }

    #[test]
    fn test_iid_distinguishes_value_kinds() {
        // "1" the string and 1 the integer must not collide.
        let s = Iid::for_id(&Value::Utf8("1".into()));
        let i = Iid::for_id(&Value::Int64(1));
        assert_ne!(s, i);
    }
}
