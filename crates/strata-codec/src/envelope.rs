//! Envelope serialisation.
//!
//! A transaction envelope is a one-row Arrow IPC stream. Its `tx-ops`
//! column is a list over a dense union with one leg per [`TxOp`] variant in
//! fixed order; the documents carried by put/patch legs form a second dense
//! union keyed by normalised table name, whose legs are created on first
//! use. Per-variant sub-builders are likewise created on first use; the
//! ordering of child columns is stable because it is reflected in the
//! union's type descriptor.
//!
//! The first byte of every serialised envelope is `0xFF` (the IPC
//! continuation marker), which doubles as the log's Tx record header.

use std::sync::Arc;

use arrow_array::builder::{
    BinaryBuilder, BooleanBuilder, FixedSizeBinaryBuilder, Float64Builder, Int64Builder,
    StringBuilder, TimestampMicrosecondBuilder,
};
use arrow_array::{
    Array, ArrayRef, ListArray, NullArray, RecordBatch, RecordBatchOptions, StringArray,
    StructArray, TimestampMicrosecondArray, UnionArray,
};
use arrow_buffer::{OffsetBuffer, ScalarBuffer};
use arrow_ipc::writer::StreamWriter;
use arrow_schema::{DataType, Field, FieldRef, Fields, Schema, TimeUnit, UnionFields};
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;

use crate::error::CodecError;
use crate::op::{normalize_table, Document, Iid, TxOp, TxOptions, Value};
use crate::sql_rewrite;

/// Envelope column: the operation list.
pub const F_TX_OPS: &str = "tx-ops";
/// Envelope column: forced logical commit time.
pub const F_SYSTEM_TIME: &str = "system-time";
/// Envelope column: default IANA zone.
pub const F_DEFAULT_TZ: &str = "default-tz";
/// Envelope column: authenticated principal.
pub const F_USER: &str = "user";

/// Union leg name for SQL ops.
pub const LEG_SQL: &str = "sql";
/// Union leg name for XTQL ops.
pub const LEG_XTQL: &str = "xtql";
/// Union leg name for put ops.
pub const LEG_PUT_DOCS: &str = "put-docs";
/// Union leg name for patch ops.
pub const LEG_PATCH_DOCS: &str = "patch-docs";
/// Union leg name for delete ops.
pub const LEG_DELETE_DOCS: &str = "delete-docs";
/// Union leg name for erase ops.
pub const LEG_ERASE_DOCS: &str = "erase-docs";
/// Union leg name for transaction-function calls.
pub const LEG_CALL: &str = "call";
/// Union leg name for the abort marker.
pub const LEG_ABORT: &str = "abort";

/// Struct field: SQL statement text.
pub const F_QUERY: &str = "query";
/// Struct field: parameter blob / opaque arguments.
pub const F_ARGS: &str = "args";
/// Struct field: serialised XTQL form.
pub const F_OP: &str = "op";
/// Struct field: per-table document union.
pub const F_DOCUMENTS: &str = "documents";
/// Struct field: identity list.
pub const F_IIDS: &str = "iids";
/// Struct field: validity range start.
pub const F_VALID_FROM: &str = "valid-from";
/// Struct field: validity range end.
pub const F_VALID_TO: &str = "valid-to";
/// Struct field: target table.
pub const F_TABLE: &str = "table";
/// Struct field: function identity.
pub const F_FN_IID: &str = "fn-iid";

const TYPE_SQL: i8 = 0;
const TYPE_XTQL: i8 = 1;
const TYPE_PUT_DOCS: i8 = 2;
const TYPE_PATCH_DOCS: i8 = 3;
const TYPE_DELETE_DOCS: i8 = 4;
const TYPE_ERASE_DOCS: i8 = 5;
const TYPE_CALL: i8 = 6;
const TYPE_ABORT: i8 = 7;

pub(crate) fn timestamp_type() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
}

/// Serialises a batch of operations into a self-describing one-row
/// columnar IPC stream.
///
/// SQL ops are first offered to the static INSERT optimiser; only when it
/// declines is the op written as `sql`.
///
/// # Errors
///
/// Any [`CodecError`] is fatal to the whole batch; no partial encoding is
/// produced.
pub fn serialize(ops: &[TxOp], opts: &TxOptions) -> Result<Vec<u8>, CodecError> {
    let mut builder = TxOpsBuilder::new();
    write_ops(&mut builder, ops)?;
    let (item_field, union) = builder.finish()?;

    let len = union.len();
    let tx_ops = ListArray::new(item_field, OffsetBuffer::from_lengths([len]), union, None);
    let system_time = TimestampMicrosecondArray::from(vec![opts
        .system_time
        .map(|t| t.timestamp_micros())])
    .with_timezone("UTC");
    let default_tz = StringArray::from(vec![opts.default_tz.as_str()]);
    let user = StringArray::from(vec![opts.user.as_deref()]);

    let schema = Arc::new(Schema::new(vec![
        Field::new(F_TX_OPS, tx_ops.data_type().clone(), false),
        Field::new(F_SYSTEM_TIME, timestamp_type(), true),
        Field::new(F_DEFAULT_TZ, DataType::Utf8, false),
        Field::new(F_USER, DataType::Utf8, true),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(tx_ops),
            Arc::new(system_time),
            Arc::new(default_tz),
            Arc::new(user),
        ],
    )?;
    write_ipc(&batch)
}

/// Appends operations into a caller-supplied list builder, preserving
/// order and applying the same SQL dispatch as [`serialize`].
///
/// # Errors
///
/// See [`serialize`].
pub fn write_ops(builder: &mut TxOpsBuilder, ops: &[TxOp]) -> Result<(), CodecError> {
    for op in ops {
        if let TxOp::Sql { query, arg_rows } = op {
            check_arg_arity(arg_rows)?;
            if let Some(rewritten) = sql_rewrite::rewrite_insert(query, arg_rows) {
                for op in &rewritten {
                    builder.push_op(op)?;
                }
                continue;
            }
        }
        builder.push_op(op)?;
    }
    Ok(())
}

fn check_arg_arity(rows: &[Vec<Value>]) -> Result<(), CodecError> {
    if let Some(first) = rows.first() {
        let expected = first.len();
        for (row, r) in rows.iter().enumerate().skip(1) {
            if r.len() != expected {
                return Err(CodecError::ArgRowArityMismatch {
                    row,
                    expected,
                    found: r.len(),
                });
            }
        }
    }
    Ok(())
}

fn check_valid_range(
    valid_from: Option<DateTime<Utc>>,
    valid_to: Option<DateTime<Utc>>,
) -> Result<(), CodecError> {
    if let (Some(from), Some(to)) = (valid_from, valid_to) {
        if from > to {
            return Err(CodecError::InvalidValidTime);
        }
    }
    Ok(())
}

fn write_ipc(batch: &RecordBatch) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut buf, batch.schema_ref())?;
        writer.write(batch)?;
        writer.finish()?;
    }
    Ok(buf)
}

// ── tx-ops list builder ────────────────────────────────────────────

/// Accumulates operations for the `tx-ops` dense union.
///
/// Per-variant sub-builders are created on first use. The eight legs are
/// always present in the type descriptor in fixed order, so unused legs
/// finish as empty children.
#[derive(Default)]
pub struct TxOpsBuilder {
    type_ids: Vec<i8>,
    offsets: Vec<i32>,
    sql: Option<SqlLeg>,
    xtql: Option<XtqlLeg>,
    put: Option<DocLeg>,
    patch: Option<DocLeg>,
    delete: Option<DeleteLeg>,
    erase: Option<EraseLeg>,
    call: Option<CallLeg>,
    aborts: usize,
}

impl TxOpsBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of operations appended so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.type_ids.len()
    }

    /// Whether no operations have been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.type_ids.is_empty()
    }

    /// Appends one operation as-is (no SQL rewrite dispatch).
    ///
    /// # Errors
    ///
    /// Validation failures (`MissingId`, `ForbiddenTable`,
    /// `InvalidValidTime`, `ArgRowArityMismatch`) leave the already
    /// appended operations untouched.
    pub fn push_op(&mut self, op: &TxOp) -> Result<(), CodecError> {
        match op {
            TxOp::Sql { query, arg_rows } => {
                check_arg_arity(arg_rows)?;
                let args = if arg_rows.is_empty() {
                    None
                } else {
                    Some(encode_arg_rows(arg_rows)?)
                };
                let leg = self.sql.get_or_insert_with(SqlLeg::default);
                self.type_ids.push(TYPE_SQL);
                self.offsets.push(cast_offset(leg.queries.len()));
                leg.queries.push(query.clone());
                leg.args.push(args);
            }
            TxOp::Xtql { op, args } => {
                let leg = self.xtql.get_or_insert_with(XtqlLeg::default);
                self.type_ids.push(TYPE_XTQL);
                self.offsets.push(cast_offset(leg.ops.len()));
                leg.ops.push(op.clone());
                leg.args.push(args.clone());
            }
            TxOp::PutDocs {
                table,
                docs,
                valid_from,
                valid_to,
            } => {
                let entry = DocEntry::prepare(table, docs, *valid_from, *valid_to)?;
                let leg = self.put.get_or_insert_with(DocLeg::default);
                self.type_ids.push(TYPE_PUT_DOCS);
                self.offsets.push(cast_offset(leg.len()));
                leg.push(entry);
            }
            TxOp::PatchDocs {
                table,
                docs,
                valid_from,
                valid_to,
            } => {
                let entry = DocEntry::prepare(table, docs, *valid_from, *valid_to)?;
                let leg = self.patch.get_or_insert_with(DocLeg::default);
                self.type_ids.push(TYPE_PATCH_DOCS);
                self.offsets.push(cast_offset(leg.len()));
                leg.push(entry);
            }
            TxOp::DeleteDocs {
                table,
                iids,
                valid_from,
                valid_to,
            } => {
                let table = normalize_table(table)?;
                check_valid_range(*valid_from, *valid_to)?;
                let leg = self.delete.get_or_insert_with(DeleteLeg::default);
                self.type_ids.push(TYPE_DELETE_DOCS);
                self.offsets.push(cast_offset(leg.tables.len()));
                leg.tables.push(table);
                leg.iids.push(iids.clone());
                leg.valid_from.push(valid_from.map(|t| t.timestamp_micros()));
                leg.valid_to.push(valid_to.map(|t| t.timestamp_micros()));
            }
            TxOp::EraseDocs { table, iids } => {
                let table = normalize_table(table)?;
                let leg = self.erase.get_or_insert_with(EraseLeg::default);
                self.type_ids.push(TYPE_ERASE_DOCS);
                self.offsets.push(cast_offset(leg.tables.len()));
                leg.tables.push(table);
                leg.iids.push(iids.clone());
            }
            TxOp::Call { fn_iid, args } => {
                let leg = self.call.get_or_insert_with(CallLeg::default);
                self.type_ids.push(TYPE_CALL);
                self.offsets.push(cast_offset(leg.fn_iids.len()));
                leg.fn_iids.push(*fn_iid);
                leg.args.push(args.clone());
            }
            TxOp::Abort => {
                self.type_ids.push(TYPE_ABORT);
                self.offsets.push(cast_offset(self.aborts));
                self.aborts += 1;
            }
        }
        Ok(())
    }

    /// Finishes the builder into the list item field and the union array.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Arrow` if array assembly fails.
    pub fn finish(self) -> Result<(FieldRef, ArrayRef), CodecError> {
        let children: Vec<ArrayRef> = vec![
            self.sql.unwrap_or_default().finish()?,
            self.xtql.unwrap_or_default().finish()?,
            self.put.unwrap_or_default().finish()?,
            self.patch.unwrap_or_default().finish()?,
            self.delete.unwrap_or_default().finish()?,
            self.erase.unwrap_or_default().finish()?,
            self.call.unwrap_or_default().finish()?,
            Arc::new(NullArray::new(self.aborts)),
        ];
        let names = [
            LEG_SQL,
            LEG_XTQL,
            LEG_PUT_DOCS,
            LEG_PATCH_DOCS,
            LEG_DELETE_DOCS,
            LEG_ERASE_DOCS,
            LEG_CALL,
            LEG_ABORT,
        ];
        let fields: Vec<Field> = names
            .iter()
            .zip(&children)
            .map(|(name, child)| {
                let nullable = matches!(child.data_type(), DataType::Null);
                Field::new(*name, child.data_type().clone(), nullable)
            })
            .collect();
        let union_fields = UnionFields::new(0_i8..8, fields);
        let union = UnionArray::try_new(
            union_fields,
            ScalarBuffer::from(self.type_ids),
            Some(ScalarBuffer::from(self.offsets)),
            children,
        )?;
        let item = Arc::new(Field::new("item", union.data_type().clone(), false));
        Ok((item, Arc::new(union) as ArrayRef))
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn cast_offset(len: usize) -> i32 {
    len as i32
}

// ── per-variant legs ───────────────────────────────────────────────

#[derive(Default)]
struct SqlLeg {
    queries: Vec<String>,
    args: Vec<Option<Vec<u8>>>,
}

impl SqlLeg {
    fn finish(self) -> Result<ArrayRef, CodecError> {
        let query: ArrayRef = Arc::new(StringArray::from_iter_values(self.queries));
        let args = binary_array(&self.args);
        struct_array(vec![
            (Field::new(F_QUERY, DataType::Utf8, false), query),
            (Field::new(F_ARGS, DataType::Binary, true), args),
        ])
    }
}

#[derive(Default)]
struct XtqlLeg {
    ops: Vec<Vec<u8>>,
    args: Vec<Option<Vec<u8>>>,
}

impl XtqlLeg {
    fn finish(self) -> Result<ArrayRef, CodecError> {
        let ops: Vec<Option<Vec<u8>>> = self.ops.into_iter().map(Some).collect();
        let op = binary_array(&ops);
        let args = binary_array(&self.args);
        struct_array(vec![
            (Field::new(F_OP, DataType::Binary, false), op),
            (Field::new(F_ARGS, DataType::Binary, true), args),
        ])
    }
}

/// One validated put/patch entry, prepared before any builder state is
/// touched so a failure leaves no partial encoding behind.
struct DocEntry {
    table: String,
    docs: Vec<Document>,
    iids: Vec<Iid>,
    valid_from: Option<i64>,
    valid_to: Option<i64>,
}

impl DocEntry {
    fn prepare(
        table: &str,
        docs: &[Document],
        valid_from: Option<DateTime<Utc>>,
        valid_to: Option<DateTime<Utc>>,
    ) -> Result<Self, CodecError> {
        let table = normalize_table(table)?;
        check_valid_range(valid_from, valid_to)?;
        let mut iids = Vec::with_capacity(docs.len());
        for doc in docs {
            let id = doc.id().ok_or(CodecError::MissingId)?;
            iids.push(Iid::for_id(id));
        }
        Ok(Self {
            table,
            docs: docs.to_vec(),
            iids,
            valid_from: valid_from.map(|t| t.timestamp_micros()),
            valid_to: valid_to.map(|t| t.timestamp_micros()),
        })
    }
}

#[derive(Default)]
struct DocLeg {
    documents: DocUnionBuilder,
    iids: Vec<Vec<Iid>>,
    valid_from: Vec<Option<i64>>,
    valid_to: Vec<Option<i64>>,
}

impl DocLeg {
    fn len(&self) -> usize {
        self.iids.len()
    }

    fn push(&mut self, entry: DocEntry) {
        self.documents.push(entry.table, entry.docs);
        self.iids.push(entry.iids);
        self.valid_from.push(entry.valid_from);
        self.valid_to.push(entry.valid_to);
    }

    fn finish(self) -> Result<ArrayRef, CodecError> {
        let documents = self.documents.finish()?;
        let iids = iids_list_array(&self.iids)?;
        struct_array(vec![
            (
                Field::new(F_DOCUMENTS, documents.data_type().clone(), false),
                documents,
            ),
            (Field::new(F_IIDS, iids.data_type().clone(), false), iids),
            (
                Field::new(F_VALID_FROM, timestamp_type(), true),
                utc_timestamps(self.valid_from),
            ),
            (
                Field::new(F_VALID_TO, timestamp_type(), true),
                utc_timestamps(self.valid_to),
            ),
        ])
    }
}

#[derive(Default)]
struct DeleteLeg {
    tables: Vec<String>,
    iids: Vec<Vec<Iid>>,
    valid_from: Vec<Option<i64>>,
    valid_to: Vec<Option<i64>>,
}

impl DeleteLeg {
    fn finish(self) -> Result<ArrayRef, CodecError> {
        let table: ArrayRef = Arc::new(StringArray::from_iter_values(self.tables));
        let iids = iids_list_array(&self.iids)?;
        struct_array(vec![
            (Field::new(F_TABLE, DataType::Utf8, false), table),
            (Field::new(F_IIDS, iids.data_type().clone(), false), iids),
            (
                Field::new(F_VALID_FROM, timestamp_type(), true),
                utc_timestamps(self.valid_from),
            ),
            (
                Field::new(F_VALID_TO, timestamp_type(), true),
                utc_timestamps(self.valid_to),
            ),
        ])
    }
}

#[derive(Default)]
struct EraseLeg {
    tables: Vec<String>,
    iids: Vec<Vec<Iid>>,
}

impl EraseLeg {
    fn finish(self) -> Result<ArrayRef, CodecError> {
        let table: ArrayRef = Arc::new(StringArray::from_iter_values(self.tables));
        let iids = iids_list_array(&self.iids)?;
        struct_array(vec![
            (Field::new(F_TABLE, DataType::Utf8, false), table),
            (Field::new(F_IIDS, iids.data_type().clone(), false), iids),
        ])
    }
}

#[derive(Default)]
struct CallLeg {
    fn_iids: Vec<Iid>,
    args: Vec<Vec<u8>>,
}

impl CallLeg {
    fn finish(self) -> Result<ArrayRef, CodecError> {
        let mut fn_iid = FixedSizeBinaryBuilder::new(16);
        for iid in &self.fn_iids {
            fn_iid.append_value(iid.as_bytes())?;
        }
        let args: Vec<Option<Vec<u8>>> = self.args.into_iter().map(Some).collect();
        let args = binary_array(&args);
        struct_array(vec![
            (
                Field::new(F_FN_IID, DataType::FixedSizeBinary(16), false),
                Arc::new(fn_iid.finish()) as ArrayRef,
            ),
            (Field::new(F_ARGS, DataType::Binary, false), args),
        ])
    }
}

// ── documents union (legs keyed by table, created on first use) ────

#[derive(Default)]
struct DocUnionBuilder {
    legs: Vec<TableLeg>,
    by_table: FxHashMap<String, usize>,
    type_ids: Vec<i8>,
    offsets: Vec<i32>,
}

struct TableLeg {
    table: String,
    lists: Vec<Vec<Document>>,
}

impl DocUnionBuilder {
    fn push(&mut self, table: String, docs: Vec<Document>) {
        let idx = match self.by_table.get(&table) {
            Some(&idx) => idx,
            None => {
                let idx = self.legs.len();
                self.by_table.insert(table.clone(), idx);
                self.legs.push(TableLeg {
                    table,
                    lists: Vec::new(),
                });
                idx
            }
        };
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        self.type_ids.push(idx as i8);
        self.offsets.push(cast_offset(self.legs[idx].lists.len()));
        self.legs[idx].lists.push(docs);
    }

    fn finish(self) -> Result<ArrayRef, CodecError> {
        let mut ids = Vec::with_capacity(self.legs.len());
        let mut fields = Vec::with_capacity(self.legs.len());
        let mut children: Vec<ArrayRef> = Vec::with_capacity(self.legs.len());
        for (idx, leg) in self.legs.into_iter().enumerate() {
            let list = docs_list_array(&leg.lists)?;
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            ids.push(idx as i8);
            fields.push(Field::new(&leg.table, list.data_type().clone(), false));
            children.push(list);
        }
        let union = UnionArray::try_new(
            UnionFields::new(ids, fields),
            ScalarBuffer::from(self.type_ids),
            Some(ScalarBuffer::from(self.offsets)),
            children,
        )?;
        Ok(Arc::new(union))
    }
}

/// Builds a `List<Struct>` over document rows. Struct fields appear in
/// first-seen order across the leg's documents; a field absent from a row
/// is null for that row.
fn docs_list_array(lists: &[Vec<Document>]) -> Result<ArrayRef, CodecError> {
    let flat: Vec<&Document> = lists.iter().flatten().collect();

    let mut field_names: Vec<&str> = Vec::new();
    for doc in &flat {
        for (name, _) in doc.fields() {
            if !field_names.contains(&name) {
                field_names.push(name);
            }
        }
    }

    let strct: ArrayRef = if field_names.is_empty() {
        Arc::new(StructArray::new_empty_fields(flat.len(), None))
    } else {
        let mut fields = Vec::with_capacity(field_names.len());
        let mut arrays = Vec::with_capacity(field_names.len());
        for name in field_names {
            let values: Vec<Option<&Value>> = flat
                .iter()
                .map(|d| d.get(name).filter(|v| !matches!(v, Value::Null)))
                .collect();
            let dt = infer_type(&values)?;
            arrays.push(build_value_array(&values, &dt)?);
            fields.push(Field::new(name, dt, true));
        }
        Arc::new(StructArray::try_new(Fields::from(fields), arrays, None)?)
    };

    let offsets = OffsetBuffer::from_lengths(lists.iter().map(Vec::len));
    let item = Arc::new(Field::new("item", strct.data_type().clone(), true));
    Ok(Arc::new(ListArray::new(item, offsets, strct, None)))
}

fn iids_list_array(iids: &[Vec<Iid>]) -> Result<ArrayRef, CodecError> {
    let mut builder = FixedSizeBinaryBuilder::new(16);
    for iid in iids.iter().flatten() {
        builder.append_value(iid.as_bytes())?;
    }
    let values: ArrayRef = Arc::new(builder.finish());
    let offsets = OffsetBuffer::from_lengths(iids.iter().map(Vec::len));
    let item = Arc::new(Field::new("item", DataType::FixedSizeBinary(16), false));
    Ok(Arc::new(ListArray::new(item, offsets, values, None)))
}

fn binary_array(values: &[Option<Vec<u8>>]) -> ArrayRef {
    let mut builder = BinaryBuilder::new();
    for v in values {
        match v {
            Some(bytes) => builder.append_value(bytes),
            None => builder.append_null(),
        }
    }
    Arc::new(builder.finish())
}

fn utc_timestamps(micros: Vec<Option<i64>>) -> ArrayRef {
    Arc::new(TimestampMicrosecondArray::from(micros).with_timezone("UTC"))
}

fn struct_array(parts: Vec<(Field, ArrayRef)>) -> Result<ArrayRef, CodecError> {
    let (fields, arrays): (Vec<Field>, Vec<ArrayRef>) = parts.into_iter().unzip();
    Ok(Arc::new(StructArray::try_new(
        Fields::from(fields),
        arrays,
        None,
    )?))
}

// ── value columns ──────────────────────────────────────────────────

fn value_data_type(value: &Value) -> DataType {
    match value {
        Value::Null => DataType::Null,
        Value::Bool(_) => DataType::Boolean,
        Value::Int64(_) => DataType::Int64,
        Value::Float64(_) => DataType::Float64,
        Value::Utf8(_) => DataType::Utf8,
        Value::Binary(_) => DataType::Binary,
        Value::Timestamp(_) => timestamp_type(),
    }
}

fn infer_type(values: &[Option<&Value>]) -> Result<DataType, CodecError> {
    let mut inferred: Option<DataType> = None;
    for value in values.iter().flatten() {
        let dt = value_data_type(value);
        match &inferred {
            None => inferred = Some(dt),
            Some(current) if *current == dt => {}
            Some(current) => {
                return Err(CodecError::Unsupported(format!(
                    "mixed value types {current} and {dt} in one column"
                )))
            }
        }
    }
    Ok(inferred.unwrap_or(DataType::Null))
}

fn build_value_array(values: &[Option<&Value>], dt: &DataType) -> Result<ArrayRef, CodecError> {
    fn unexpected(value: &Value) -> CodecError {
        CodecError::Unsupported(format!("unexpected value {value:?} for inferred column type"))
    }

    Ok(match dt {
        DataType::Null => Arc::new(NullArray::new(values.len())),
        DataType::Boolean => {
            let mut b = BooleanBuilder::with_capacity(values.len());
            for v in values {
                match v {
                    Some(Value::Bool(x)) => b.append_value(*x),
                    None => b.append_null(),
                    Some(other) => return Err(unexpected(other)),
                }
            }
            Arc::new(b.finish())
        }
        DataType::Int64 => {
            let mut b = Int64Builder::with_capacity(values.len());
            for v in values {
                match v {
                    Some(Value::Int64(x)) => b.append_value(*x),
                    None => b.append_null(),
                    Some(other) => return Err(unexpected(other)),
                }
            }
            Arc::new(b.finish())
        }
        DataType::Float64 => {
            let mut b = Float64Builder::with_capacity(values.len());
            for v in values {
                match v {
                    Some(Value::Float64(x)) => b.append_value(*x),
                    None => b.append_null(),
                    Some(other) => return Err(unexpected(other)),
                }
            }
            Arc::new(b.finish())
        }
        DataType::Utf8 => {
            let mut b = StringBuilder::new();
            for v in values {
                match v {
                    Some(Value::Utf8(x)) => b.append_value(x),
                    None => b.append_null(),
                    Some(other) => return Err(unexpected(other)),
                }
            }
            Arc::new(b.finish())
        }
        DataType::Binary => {
            let mut b = BinaryBuilder::new();
            for v in values {
                match v {
                    Some(Value::Binary(x)) => b.append_value(x),
                    None => b.append_null(),
                    Some(other) => return Err(unexpected(other)),
                }
            }
            Arc::new(b.finish())
        }
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            let mut b = TimestampMicrosecondBuilder::with_capacity(values.len());
            for v in values {
                match v {
                    Some(Value::Timestamp(t)) => b.append_value(t.timestamp_micros()),
                    None => b.append_null(),
                    Some(other) => return Err(unexpected(other)),
                }
            }
            Arc::new(b.finish().with_timezone("UTC"))
        }
        other => {
            return Err(CodecError::Unsupported(format!(
                "column type {other} is not part of the envelope contract"
            )))
        }
    })
}

/// Encodes SQL parameter rows as a nested IPC stream of one struct row per
/// parameter set, columns named `_0..`.
pub(crate) fn encode_arg_rows(rows: &[Vec<Value>]) -> Result<Vec<u8>, CodecError> {
    let arity = rows.first().map_or(0, Vec::len);
    let mut fields = Vec::with_capacity(arity);
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(arity);
    for c in 0..arity {
        let values: Vec<Option<&Value>> = rows
            .iter()
            .map(|r| r.get(c).filter(|v| !matches!(v, Value::Null)))
            .collect();
        let dt = infer_type(&values)?;
        columns.push(build_value_array(&values, &dt)?);
        fields.push(Field::new(format!("_{c}"), dt, true));
    }
    let schema = Arc::new(Schema::new(fields));
    let options = RecordBatchOptions::new().with_row_count(Some(rows.len()));
    let batch = RecordBatch::try_new_with_options(schema, columns, &options)?;
    write_ipc(&batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str) -> Document {
        Document::new().with_field("_id", Value::Utf8(id.into()))
    }

    #[test]
    fn test_envelope_starts_with_tx_header_byte() {
        let bytes = serialize(
            &[TxOp::put_docs("users", vec![doc("a")])],
            &TxOptions::default(),
        )
        .unwrap();
        // An IPC stream opens with the continuation marker; the log relies
        // on this first byte to identify Tx records.
        assert_eq!(bytes[0], 0xFF);
    }

    #[test]
    fn test_missing_id_is_fatal() {
        let op = TxOp::put_docs(
            "users",
            vec![Document::new().with_field("name", Value::Utf8("A".into()))],
        );
        assert!(matches!(
            serialize(&[op], &TxOptions::default()),
            Err(CodecError::MissingId)
        ));
    }

    #[test]
    fn test_forbidden_table_is_fatal() {
        let op = TxOp::put_docs("information_schema/x", vec![doc("1")]);
        assert!(matches!(
            serialize(&[op], &TxOptions::default()),
            Err(CodecError::ForbiddenTable(_))
        ));
    }

    #[test]
    fn test_arg_row_arity_mismatch() {
        let op = TxOp::sql_with_args(
            "INSERT INTO t VALUES (?, ?)",
            vec![
                vec![Value::Int64(1), Value::Int64(2)],
                vec![Value::Int64(3)],
            ],
        );
        assert!(matches!(
            serialize(&[op], &TxOptions::default()),
            Err(CodecError::ArgRowArityMismatch {
                row: 1,
                expected: 2,
                found: 1
            })
        ));
    }

    #[test]
    fn test_invalid_valid_range() {
        let op = TxOp::PutDocs {
            table: "t".into(),
            docs: vec![doc("a")],
            valid_from: Some("2024-02-01T00:00:00Z".parse().unwrap()),
            valid_to: Some("2024-01-01T00:00:00Z".parse().unwrap()),
        };
        assert!(matches!(
            serialize(&[op], &TxOptions::default()),
            Err(CodecError::InvalidValidTime)
        ));
    }

    #[test]
    fn test_validation_failure_leaves_builder_untouched() {
        let mut builder = TxOpsBuilder::new();
        builder.push_op(&TxOp::put_docs("t", vec![doc("a")])).unwrap();
        let bad = TxOp::put_docs("t", vec![Document::new()]);
        assert!(builder.push_op(&bad).is_err());
        assert_eq!(builder.len(), 1);
    }

    #[test]
    fn test_mixed_doc_field_types_rejected() {
        let docs = vec![
            doc("a").with_field("v", Value::Int64(1)),
            doc("b").with_field("v", Value::Utf8("x".into())),
        ];
        assert!(matches!(
            serialize(&[TxOp::put_docs("t", docs)], &TxOptions::default()),
            Err(CodecError::Unsupported(_))
        ));
    }
}
