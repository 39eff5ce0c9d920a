//! Envelope decoding.
//!
//! [`decode_record`] reads a serialised envelope back into its options and
//! a lazy, single-pass [`OpsCursor`] over the decoded operations. Union
//! legs are dispatched by field name, so the decoder is independent of the
//! numeric type ids a writer happened to assign.

use std::io::Cursor;

use arrow_array::{
    Array, ArrayRef, BinaryArray, BooleanArray, FixedSizeBinaryArray, Float64Array, Int64Array,
    ListArray, RecordBatch, StringArray, StructArray, TimestampMicrosecondArray, UnionArray,
};
use arrow_ipc::reader::StreamReader;
use arrow_schema::{DataType, TimeUnit, UnionMode};
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;

use crate::envelope::{
    F_ARGS, F_DEFAULT_TZ, F_DOCUMENTS, F_FN_IID, F_IIDS, F_OP, F_QUERY, F_SYSTEM_TIME, F_TABLE,
    F_TX_OPS, F_USER, F_VALID_FROM, F_VALID_TO, LEG_ABORT, LEG_CALL, LEG_DELETE_DOCS,
    LEG_ERASE_DOCS, LEG_PATCH_DOCS, LEG_PUT_DOCS, LEG_SQL, LEG_XTQL,
};
use crate::error::CodecError;
use crate::op::{Document, Iid, TxOp, Value};

/// Reads the one-row envelope batch out of an IPC stream.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] when the stream is empty or carries a
/// row count other than one.
pub fn read_envelope_batch(bytes: &[u8]) -> Result<RecordBatch, CodecError> {
    let mut reader = StreamReader::try_new(Cursor::new(bytes), None)?;
    let batch = reader
        .next()
        .ok_or_else(|| CodecError::Decode("empty envelope stream".into()))??;
    if batch.num_rows() != 1 {
        return Err(CodecError::Decode(format!(
            "expected one envelope row, got {}",
            batch.num_rows()
        )));
    }
    Ok(batch)
}

/// Decodes a serialised envelope.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed bytes.
pub fn decode_record(bytes: &[u8]) -> Result<TxEnvelope, CodecError> {
    TxEnvelope::from_batch(&read_envelope_batch(bytes)?)
}

/// A decoded transaction envelope.
#[derive(Debug)]
pub struct TxEnvelope {
    /// Forced logical commit time, when present.
    pub system_time: Option<DateTime<Utc>>,
    /// Default IANA zone.
    pub default_tz: String,
    /// Authenticated principal, if any.
    pub user: Option<String>,
    ops: OpsCursor,
}

impl TxEnvelope {
    /// Builds an envelope view over an already materialised batch.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] when the batch does not match the
    /// envelope schema.
    pub fn from_batch(batch: &RecordBatch) -> Result<Self, CodecError> {
        let tx_ops: &ListArray = downcast(column(batch, F_TX_OPS)?, "tx-ops list")?;
        #[allow(clippy::cast_sign_loss)]
        let (start, end) = (
            tx_ops.value_offsets()[0] as usize,
            tx_ops.value_offsets()[1] as usize,
        );
        let union: &UnionArray = downcast(tx_ops.values(), "tx-ops union")?;
        let DataType::Union(union_fields, UnionMode::Dense) = tx_ops.values().data_type() else {
            return Err(CodecError::Decode("tx-ops is not a dense union".into()));
        };
        let legs: FxHashMap<i8, String> = union_fields
            .iter()
            .map(|(id, field)| (id, field.name().clone()))
            .collect();

        let st: &TimestampMicrosecondArray =
            downcast(column(batch, F_SYSTEM_TIME)?, "system-time")?;
        let system_time = if st.is_null(0) {
            None
        } else {
            Some(micros_to_instant(st.value(0))?)
        };
        let tz: &StringArray = downcast(column(batch, F_DEFAULT_TZ)?, "default-tz")?;
        let user_col: &StringArray = downcast(column(batch, F_USER)?, "user")?;
        let user = (!user_col.is_null(0)).then(|| user_col.value(0).to_string());

        Ok(Self {
            system_time,
            default_tz: tz.value(0).to_string(),
            user,
            ops: OpsCursor {
                union: union.clone(),
                legs,
                index: start,
                end,
            },
        })
    }

    /// Number of operations in the envelope.
    #[must_use]
    pub fn op_count(&self) -> usize {
        self.ops.end - self.ops.index
    }

    /// Consumes the envelope into its lazy operation iterator.
    #[must_use]
    pub fn ops(self) -> OpsCursor {
        self.ops
    }
}

/// Lazy, single-pass iterator over the decoded operations.
#[derive(Debug)]
pub struct OpsCursor {
    union: UnionArray,
    legs: FxHashMap<i8, String>,
    index: usize,
    end: usize,
}

impl Iterator for OpsCursor {
    type Item = Result<TxOp, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.end {
            return None;
        }
        let item = decode_op(&self.union, &self.legs, self.index);
        self.index += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end - self.index;
        (remaining, Some(remaining))
    }
}

fn decode_op(
    union: &UnionArray,
    legs: &FxHashMap<i8, String>,
    index: usize,
) -> Result<TxOp, CodecError> {
    let type_id = union.type_id(index);
    let offset = union.value_offset(index);
    let leg = legs
        .get(&type_id)
        .ok_or_else(|| CodecError::UnknownOpVariant(format!("type id {type_id}")))?;
    let child = union.child(type_id);

    match leg.as_str() {
        LEG_SQL => {
            let st: &StructArray = downcast(child, "sql struct")?;
            let query: &StringArray = downcast(struct_col(st, F_QUERY)?, "sql query")?;
            let args: &BinaryArray = downcast(struct_col(st, F_ARGS)?, "sql args")?;
            let arg_rows = if args.is_null(offset) {
                Vec::new()
            } else {
                decode_arg_rows(args.value(offset))?
            };
            Ok(TxOp::Sql {
                query: query.value(offset).to_string(),
                arg_rows,
            })
        }
        LEG_XTQL => {
            let st: &StructArray = downcast(child, "xtql struct")?;
            let op: &BinaryArray = downcast(struct_col(st, F_OP)?, "xtql op")?;
            let args: &BinaryArray = downcast(struct_col(st, F_ARGS)?, "xtql args")?;
            Ok(TxOp::Xtql {
                op: op.value(offset).to_vec(),
                args: (!args.is_null(offset)).then(|| args.value(offset).to_vec()),
            })
        }
        LEG_PUT_DOCS => {
            let (table, docs, valid_from, valid_to) = decode_doc_entry(child, offset)?;
            Ok(TxOp::PutDocs {
                table,
                docs,
                valid_from,
                valid_to,
            })
        }
        LEG_PATCH_DOCS => {
            let (table, docs, valid_from, valid_to) = decode_doc_entry(child, offset)?;
            Ok(TxOp::PatchDocs {
                table,
                docs,
                valid_from,
                valid_to,
            })
        }
        LEG_DELETE_DOCS => {
            let st: &StructArray = downcast(child, "delete-docs struct")?;
            let table: &StringArray = downcast(struct_col(st, F_TABLE)?, "delete table")?;
            Ok(TxOp::DeleteDocs {
                table: table.value(offset).to_string(),
                iids: decode_iids(st, offset)?,
                valid_from: optional_instant(st, F_VALID_FROM, offset)?,
                valid_to: optional_instant(st, F_VALID_TO, offset)?,
            })
        }
        LEG_ERASE_DOCS => {
            let st: &StructArray = downcast(child, "erase-docs struct")?;
            let table: &StringArray = downcast(struct_col(st, F_TABLE)?, "erase table")?;
            Ok(TxOp::EraseDocs {
                table: table.value(offset).to_string(),
                iids: decode_iids(st, offset)?,
            })
        }
        LEG_CALL => {
            let st: &StructArray = downcast(child, "call struct")?;
            let fn_iid: &FixedSizeBinaryArray = downcast(struct_col(st, F_FN_IID)?, "fn-iid")?;
            let args: &BinaryArray = downcast(struct_col(st, F_ARGS)?, "call args")?;
            let bytes: [u8; 16] = fn_iid
                .value(offset)
                .try_into()
                .map_err(|_| CodecError::Decode("fn-iid is not 16 bytes".into()))?;
            Ok(TxOp::Call {
                fn_iid: Iid(bytes),
                args: args.value(offset).to_vec(),
            })
        }
        LEG_ABORT => Ok(TxOp::Abort),
        other => Err(CodecError::UnknownOpVariant(other.to_string())),
    }
}

fn decode_doc_entry(
    child: &ArrayRef,
    offset: usize,
) -> Result<
    (
        String,
        Vec<Document>,
        Option<DateTime<Utc>>,
        Option<DateTime<Utc>>,
    ),
    CodecError,
> {
    let st: &StructArray = downcast(child, "doc-op struct")?;
    let documents: &UnionArray = downcast(struct_col(st, F_DOCUMENTS)?, "documents union")?;
    let DataType::Union(fields, UnionMode::Dense) = documents.data_type() else {
        return Err(CodecError::Decode("documents is not a dense union".into()));
    };

    let table_type_id = documents.type_id(offset);
    let list_row = documents.value_offset(offset);
    let table = fields
        .iter()
        .find(|(id, _)| *id == table_type_id)
        .map(|(_, field)| field.name().clone())
        .ok_or_else(|| CodecError::Decode(format!("no table leg for type id {table_type_id}")))?;

    let list: &ListArray = downcast(documents.child(table_type_id), "document list")?;
    #[allow(clippy::cast_sign_loss)]
    let (doc_start, doc_end) = (
        list.value_offsets()[list_row] as usize,
        list.value_offsets()[list_row + 1] as usize,
    );
    let rows: &StructArray = downcast(list.values(), "document rows")?;
    let docs = (doc_start..doc_end)
        .map(|row| struct_row_to_doc(rows, row))
        .collect::<Result<Vec<_>, _>>()?;

    Ok((
        table,
        docs,
        optional_instant(st, F_VALID_FROM, offset)?,
        optional_instant(st, F_VALID_TO, offset)?,
    ))
}

fn struct_row_to_doc(rows: &StructArray, row: usize) -> Result<Document, CodecError> {
    let mut doc = Document::new();
    for (field, col) in rows.fields().iter().zip(rows.columns()) {
        if !col.is_null(row) {
            doc.insert(field.name().clone(), array_value(col, row)?);
        }
    }
    Ok(doc)
}

fn decode_iids(st: &StructArray, offset: usize) -> Result<Vec<Iid>, CodecError> {
    let list: &ListArray = downcast(struct_col(st, F_IIDS)?, "iid list")?;
    #[allow(clippy::cast_sign_loss)]
    let (start, end) = (
        list.value_offsets()[offset] as usize,
        list.value_offsets()[offset + 1] as usize,
    );
    let values: &FixedSizeBinaryArray = downcast(list.values(), "iid bytes")?;
    (start..end)
        .map(|i| {
            let bytes: [u8; 16] = values
                .value(i)
                .try_into()
                .map_err(|_| CodecError::Decode("iid is not 16 bytes".into()))?;
            Ok(Iid(bytes))
        })
        .collect()
}

/// Decodes a SQL parameter blob back into rows. Unlike document fields,
/// null parameter cells round-trip as explicit [`Value::Null`] so row
/// arity is preserved.
fn decode_arg_rows(bytes: &[u8]) -> Result<Vec<Vec<Value>>, CodecError> {
    let mut reader = StreamReader::try_new(Cursor::new(bytes), None)?;
    let batch = reader
        .next()
        .ok_or_else(|| CodecError::Decode("empty arg stream".into()))??;
    let mut rows = vec![Vec::with_capacity(batch.num_columns()); batch.num_rows()];
    for col in batch.columns() {
        for (row, out) in rows.iter_mut().enumerate() {
            if col.is_null(row) {
                out.push(Value::Null);
            } else {
                out.push(array_value(col, row)?);
            }
        }
    }
    Ok(rows)
}

fn array_value(col: &ArrayRef, row: usize) -> Result<Value, CodecError> {
    Ok(match col.data_type() {
        DataType::Boolean => {
            Value::Bool(downcast::<BooleanArray>(col, "boolean column")?.value(row))
        }
        DataType::Int64 => Value::Int64(downcast::<Int64Array>(col, "int column")?.value(row)),
        DataType::Float64 => {
            Value::Float64(downcast::<Float64Array>(col, "float column")?.value(row))
        }
        DataType::Utf8 => {
            Value::Utf8(downcast::<StringArray>(col, "string column")?.value(row).to_string())
        }
        DataType::Binary => {
            Value::Binary(downcast::<BinaryArray>(col, "binary column")?.value(row).to_vec())
        }
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            let micros =
                downcast::<TimestampMicrosecondArray>(col, "timestamp column")?.value(row);
            Value::Timestamp(micros_to_instant(micros)?)
        }
        other => {
            return Err(CodecError::Decode(format!(
                "column type {other} is not part of the envelope contract"
            )))
        }
    })
}

fn micros_to_instant(micros: i64) -> Result<DateTime<Utc>, CodecError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| CodecError::Decode(format!("timestamp {micros} out of range")))
}

fn optional_instant(
    st: &StructArray,
    name: &str,
    row: usize,
) -> Result<Option<DateTime<Utc>>, CodecError> {
    let col: &TimestampMicrosecondArray = downcast(struct_col(st, name)?, name)?;
    if col.is_null(row) {
        Ok(None)
    } else {
        micros_to_instant(col.value(row)).map(Some)
    }
}

fn column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef, CodecError> {
    batch
        .column_by_name(name)
        .ok_or_else(|| CodecError::Decode(format!("missing envelope column '{name}'")))
}

fn struct_col<'a>(st: &'a StructArray, name: &str) -> Result<&'a ArrayRef, CodecError> {
    st.column_by_name(name)
        .ok_or_else(|| CodecError::Decode(format!("missing struct field '{name}'")))
}

fn downcast<'a, T: 'static>(array: &'a dyn Array, what: &str) -> Result<&'a T, CodecError> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| CodecError::Decode(format!("unexpected array type for {what}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::serialize;
    use crate::op::TxOptions;

    fn round_trip(ops: &[TxOp], opts: &TxOptions) -> Vec<TxOp> {
        let bytes = serialize(ops, opts).unwrap();
        decode_record(&bytes)
            .unwrap()
            .ops()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    fn doc(id: &str) -> Document {
        Document::new().with_field("_id", Value::Utf8(id.into()))
    }

    #[test]
    fn test_put_docs_round_trip() {
        let valid_from: DateTime<Utc> = "2024-01-01T00:00:00Z".parse().unwrap();
        let ops = vec![TxOp::PutDocs {
            table: "users".into(),
            docs: vec![
                doc("a").with_field("name", Value::Utf8("A".into())),
                doc("b").with_field("name", Value::Utf8("B".into())),
            ],
            valid_from: Some(valid_from),
            valid_to: None,
        }];
        let decoded = round_trip(&ops, &TxOptions::default());

        // Same op back, up to the documented table-name normalisation.
        assert_eq!(decoded.len(), 1);
        let TxOp::PutDocs {
            table,
            docs,
            valid_from: vf,
            valid_to,
        } = &decoded[0]
        else {
            panic!("expected put-docs, got {decoded:?}");
        };
        assert_eq!(table, "public/users");
        assert_eq!(vf, &Some(valid_from));
        assert_eq!(valid_to, &None);
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].get("name"), Some(&Value::Utf8("A".into())));
    }

    #[test]
    fn test_put_docs_iids_on_the_wire() {
        let ops = vec![TxOp::put_docs("users", vec![doc("a"), doc("b")])];
        let bytes = serialize(&ops, &TxOptions::default()).unwrap();
        let batch = read_envelope_batch(&bytes).unwrap();

        let list: &ListArray = downcast(column(&batch, F_TX_OPS).unwrap(), "list").unwrap();
        let union: &UnionArray = downcast(list.values(), "union").unwrap();
        let put: &StructArray = downcast(union.child(2), "put leg").unwrap();
        let iids = decode_iids(put, 0).unwrap();

        assert_eq!(
            iids,
            vec![
                Iid::for_id(&Value::Utf8("a".into())),
                Iid::for_id(&Value::Utf8("b".into())),
            ]
        );
    }

    #[test]
    fn test_sql_insert_rewrites_to_put_docs_on_the_wire() {
        let ops = vec![TxOp::sql_with_args(
            "INSERT INTO t (_id, v) VALUES (?, ?)",
            vec![
                vec![Value::Int64(1), Value::Utf8("x".into())],
                vec![Value::Int64(2), Value::Utf8("y".into())],
            ],
        )];
        let decoded = round_trip(&ops, &TxOptions::default());

        assert_eq!(decoded.len(), 2);
        for (op, id) in decoded.iter().zip([1_i64, 2]) {
            let TxOp::PutDocs { table, docs, .. } = op else {
                panic!("expected put-docs, got {op:?}");
            };
            assert_eq!(table, "public/t");
            assert_eq!(docs[0].get("_id"), Some(&Value::Int64(id)));
        }
    }

    #[test]
    fn test_non_insert_sql_round_trips_with_args() {
        let ops = vec![TxOp::sql_with_args(
            "SELECT * FROM t WHERE v > ?",
            vec![vec![Value::Int64(1)], vec![Value::Null]],
        )];
        assert_eq!(round_trip(&ops, &TxOptions::default()), ops);
    }

    #[test]
    fn test_delete_erase_call_xtql_abort_round_trip() {
        let iid = Iid::for_id(&Value::Utf8("gone".into()));
        let ops = vec![
            TxOp::DeleteDocs {
                table: "public/users".into(),
                iids: vec![iid],
                valid_from: Some("2024-01-01T00:00:00Z".parse().unwrap()),
                valid_to: Some("2025-01-01T00:00:00Z".parse().unwrap()),
            },
            TxOp::EraseDocs {
                table: "public/users".into(),
                iids: vec![iid],
            },
            TxOp::Call {
                fn_iid: iid,
                args: vec![1, 2, 3],
            },
            TxOp::Xtql {
                op: vec![9, 9],
                args: None,
            },
            TxOp::Abort,
        ];
        assert_eq!(round_trip(&ops, &TxOptions::default()), ops);
    }

    #[test]
    fn test_op_order_preserved_across_variants_and_tables() {
        let ops = vec![
            TxOp::put_docs("a", vec![doc("1")]),
            TxOp::sql("SELECT 1"),
            TxOp::put_docs("b", vec![doc("2")]),
            TxOp::put_docs("a", vec![doc("3")]),
        ];
        let decoded = round_trip(&ops, &TxOptions::default());
        assert_eq!(decoded.len(), 4);
        let tables: Vec<Option<&str>> = decoded
            .iter()
            .map(|op| match op {
                TxOp::PutDocs { table, .. } => Some(table.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            tables,
            vec![Some("public/a"), None, Some("public/b"), Some("public/a")]
        );
    }

    #[test]
    fn test_envelope_options_round_trip() {
        let opts = TxOptions {
            system_time: Some("2024-06-01T12:00:00Z".parse().unwrap()),
            default_tz: "Europe/London".into(),
            user: Some("ada".into()),
        };
        let bytes = serialize(&[TxOp::put_docs("t", vec![doc("a")])], &opts).unwrap();
        let envelope = decode_record(&bytes).unwrap();
        assert_eq!(envelope.system_time, opts.system_time);
        assert_eq!(envelope.default_tz, "Europe/London");
        assert_eq!(envelope.user.as_deref(), Some("ada"));
        assert_eq!(envelope.op_count(), 1);
    }

    #[test]
    fn test_explicit_null_doc_field_is_dropped() {
        // Explicit nulls and absent fields are indistinguishable on the
        // wire; both decode as absent.
        let ops = vec![TxOp::put_docs(
            "t",
            vec![doc("a").with_field("x", Value::Null)],
        )];
        let decoded = round_trip(&ops, &TxOptions::default());
        let TxOp::PutDocs { docs, .. } = &decoded[0] else {
            panic!();
        };
        assert!(docs[0].get("x").is_none());
        assert_eq!(docs[0].len(), 1);
    }

    #[test]
    fn test_uneven_doc_fields_round_trip() {
        let ops = vec![TxOp::put_docs(
            "t",
            vec![
                doc("a").with_field("x", Value::Int64(1)),
                doc("b").with_field("y", Value::Bool(true)),
            ],
        )];
        let decoded = round_trip(&ops, &TxOptions::default());
        let TxOp::PutDocs { docs, .. } = &decoded[0] else {
            panic!();
        };
        assert_eq!(docs[0].get("x"), Some(&Value::Int64(1)));
        assert!(docs[0].get("y").is_none());
        assert_eq!(docs[1].get("y"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_value_kinds_round_trip() {
        let ts: DateTime<Utc> = "2024-03-01T08:30:00Z".parse().unwrap();
        let ops = vec![TxOp::put_docs(
            "t",
            vec![doc("a")
                .with_field("b", Value::Bool(false))
                .with_field("i", Value::Int64(-7))
                .with_field("f", Value::Float64(1.5))
                .with_field("s", Value::Utf8("text".into()))
                .with_field("bin", Value::Binary(vec![0, 255]))
                .with_field("ts", Value::Timestamp(ts))],
        )];
        let decoded = round_trip(&ops, &TxOptions::default());
        let TxOp::PutDocs { docs, .. } = &decoded[0] else {
            panic!();
        };
        assert_eq!(docs[0].get("ts"), Some(&Value::Timestamp(ts)));
        assert_eq!(docs[0].get("bin"), Some(&Value::Binary(vec![0, 255])));
        assert_eq!(docs[0].len(), 7);
    }
}
