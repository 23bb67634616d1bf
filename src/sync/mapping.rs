//! Explicit remote-field to local-column maps
//!
//! Each tracked collection has a [`CollectionMapping`] naming its local
//! table, the rule that yields the local primary key, an optional equality
//! filter, and one [`FieldMap`] per mirrored column. Column types and NOT NULL
//! constraints are taken from the table's target schema.

use chrono::SecondsFormat;
use rusqlite::types::Value;

use super::remote::{RemoteDocument, RemoteValue};
use crate::db::schema::{ColumnType, TableSchema};
use crate::db::tables;
use crate::error::{RecordMappingError, SchemaError};

/// Where the local primary key comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRule {
    DocumentId,
    /// A document field, falling back to the document id when absent or empty
    FieldOrDocumentId(String),
}

/// Value written when the remote field is missing or null
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// NULL, or `''` for NOT NULL text columns
    Empty,
    /// The time of the current sync pass
    SyncTime,
}

/// One remote field mirrored into one local column
#[derive(Debug, Clone)]
pub struct FieldMap {
    pub remote: String,
    pub column: String,
    pub col_type: ColumnType,
    pub not_null: bool,
    pub fallback: Fallback,
}

/// A remote document converted to column values
#[derive(Debug, Clone, PartialEq)]
pub struct MappedRecord {
    pub key: String,
    pub doc_id: String,
    /// `(column, value)` in mapping order, key column excluded
    pub values: Vec<(String, Value)>,
}

/// How one remote collection lands in its local table
#[derive(Debug, Clone)]
pub struct CollectionMapping {
    pub collection: String,
    pub table: String,
    pub key_column: String,
    pub key_rule: KeyRule,
    /// Only documents whose field equals this string are mirrored
    pub filter: Option<(String, String)>,
    pub fields: Vec<FieldMap>,
}

impl CollectionMapping {
    /// Start a mapping onto `schema`, keyed by its primary key column
    pub fn builder(collection: &str, schema: TableSchema) -> MappingBuilder {
        MappingBuilder {
            collection: collection.to_string(),
            schema,
            key_rule: KeyRule::DocumentId,
            filter: None,
            fields: Vec::new(),
            error: None,
        }
    }

    /// Whether `doc` passes the equality filter
    pub fn accepts(&self, doc: &RemoteDocument) -> bool {
        match &self.filter {
            None => true,
            Some((field, expected)) => doc.get(field).and_then(RemoteValue::as_str) == Some(expected.as_str()),
        }
    }

    /// Derive the local key for `doc`
    pub fn key_for(&self, doc: &RemoteDocument) -> Result<String, RecordMappingError> {
        let key = match &self.key_rule {
            KeyRule::DocumentId => doc.id.clone(),
            KeyRule::FieldOrDocumentId(field) => match doc.get(field) {
                None | Some(RemoteValue::Null) => doc.id.clone(),
                Some(value) => match text_of(value) {
                    Some(text) if !text.trim().is_empty() => text,
                    Some(_) => doc.id.clone(),
                    None => {
                        return Err(RecordMappingError::InvalidValue {
                            doc_id: doc.id.clone(),
                            field: field.clone(),
                            expected: "key",
                        })
                    }
                },
            },
        };

        if key.trim().is_empty() {
            return Err(RecordMappingError::MissingKey { doc_id: doc.id.clone() });
        }
        Ok(key)
    }

    /// Convert `doc` into column values. `sync_time` fills fields whose
    /// fallback is [`Fallback::SyncTime`].
    pub fn map_document(&self, doc: &RemoteDocument, sync_time: &str) -> Result<MappedRecord, RecordMappingError> {
        if let Some(reason) = &doc.malformed {
            return Err(RecordMappingError::Undecodable {
                doc_id: doc.id.clone(),
                reason: reason.clone(),
            });
        }
        let key = self.key_for(doc)?;

        let values = self
            .fields
            .iter()
            .map(|field| Ok((field.column.clone(), field.convert(doc, sync_time)?)))
            .collect::<Result<Vec<_>, RecordMappingError>>()?;

        Ok(MappedRecord {
            key,
            doc_id: doc.id.clone(),
            values,
        })
    }
}

impl FieldMap {
    fn convert(&self, doc: &RemoteDocument, sync_time: &str) -> Result<Value, RecordMappingError> {
        let invalid = |expected| RecordMappingError::InvalidValue {
            doc_id: doc.id.clone(),
            field: self.remote.clone(),
            expected,
        };

        let value = match doc.get(&self.remote) {
            None | Some(RemoteValue::Null) => return Ok(self.missing(sync_time)),
            Some(value) => value,
        };

        let converted = match self.col_type {
            ColumnType::Text => Value::Text(text_of(value).ok_or_else(|| invalid("text"))?),
            ColumnType::Real => match value {
                RemoteValue::Double(v) => Value::Real(*v),
                RemoteValue::Integer(v) => Value::Real(*v as f64),
                RemoteValue::String(s) if s.trim().is_empty() => return Ok(self.missing(sync_time)),
                RemoteValue::String(s) => Value::Real(s.trim().parse::<f64>().map_err(|_| invalid("number"))?),
                _ => return Err(invalid("number")),
            },
            ColumnType::Integer => match value {
                RemoteValue::Integer(v) => Value::Integer(*v),
                RemoteValue::Double(v) if v.fract() == 0.0 => Value::Integer(*v as i64),
                RemoteValue::Bool(b) => Value::Integer(i64::from(*b)),
                RemoteValue::String(s) if s.trim().is_empty() => return Ok(self.missing(sync_time)),
                RemoteValue::String(s) => Value::Integer(s.trim().parse::<i64>().map_err(|_| invalid("integer"))?),
                _ => return Err(invalid("integer")),
            },
            ColumnType::Blob => match value {
                RemoteValue::String(s) => Value::Blob(s.clone().into_bytes()),
                _ => return Err(invalid("blob")),
            },
        };
        Ok(converted)
    }

    fn missing(&self, sync_time: &str) -> Value {
        match (self.fallback, self.col_type, self.not_null) {
            (Fallback::SyncTime, ColumnType::Text, _) => Value::Text(sync_time.to_string()),
            (_, ColumnType::Text, true) => Value::Text(String::new()),
            (_, ColumnType::Real, true) => Value::Real(0.0),
            (_, ColumnType::Integer, true) => Value::Integer(0),
            _ => Value::Null,
        }
    }
}

/// Scalar rendered as text; `None` for maps, arrays and geo points
fn text_of(value: &RemoteValue) -> Option<String> {
    match value {
        RemoteValue::String(s) | RemoteValue::Reference(s) => Some(s.clone()),
        RemoteValue::Integer(v) => Some(v.to_string()),
        RemoteValue::Double(v) => Some(v.to_string()),
        RemoteValue::Bool(b) => Some(b.to_string()),
        RemoteValue::Timestamp(ts) => Some(ts.to_rfc3339_opts(SecondsFormat::Secs, true)),
        RemoteValue::Null => Some(String::new()),
        RemoteValue::GeoPoint { .. } | RemoteValue::Array(_) | RemoteValue::Map(_) => None,
    }
}

/// Builder that resolves column types from the target schema
pub struct MappingBuilder {
    collection: String,
    schema: TableSchema,
    key_rule: KeyRule,
    filter: Option<(String, String)>,
    fields: Vec<FieldMap>,
    error: Option<SchemaError>,
}

impl MappingBuilder {
    pub fn key_rule(mut self, rule: KeyRule) -> Self {
        self.key_rule = rule;
        self
    }

    pub fn filter(mut self, field: &str, equals: &str) -> Self {
        self.filter = Some((field.to_string(), equals.to_string()));
        self
    }

    /// Mirror remote `field` into `column`
    pub fn field(self, remote: &str, column: &str) -> Self {
        self.field_with(remote, column, Fallback::Empty)
    }

    /// Mirror a field whose name is the same on both sides
    pub fn same(self, name: &str) -> Self {
        self.field_with(name, name, Fallback::Empty)
    }

    pub fn field_with(mut self, remote: &str, column: &str, fallback: Fallback) -> Self {
        match self.schema.column(column) {
            Some(spec) => self.fields.push(FieldMap {
                remote: remote.to_string(),
                column: spec.name.clone(),
                col_type: spec.col_type,
                not_null: spec.not_null,
                fallback,
            }),
            None => {
                self.error.get_or_insert(SchemaError::Invalid {
                    table: self.schema.name.clone(),
                    reason: format!("mapped column {} does not exist", column),
                });
            }
        }
        self
    }

    pub fn build(self) -> Result<CollectionMapping, SchemaError> {
        if let Some(err) = self.error {
            return Err(err);
        }

        let key = self.schema.primary_key().ok_or_else(|| SchemaError::Invalid {
            table: self.schema.name.clone(),
            reason: "mapped table needs a primary key".to_string(),
        })?;
        let key_column = key.name.clone();

        if self.fields.iter().any(|f| f.column == key_column) {
            return Err(SchemaError::Invalid {
                table: self.schema.name.clone(),
                reason: format!("key column {} cannot also be a mapped field", key_column),
            });
        }

        Ok(CollectionMapping {
            collection: self.collection,
            table: self.schema.name.clone(),
            key_column,
            key_rule: self.key_rule,
            filter: self.filter,
            fields: self.fields,
        })
    }
}

/// Approved institutions only
pub fn institutions() -> Result<CollectionMapping, SchemaError> {
    CollectionMapping::builder("institutions", tables::institutions()?)
        .filter("status", "approved")
        .same("name")
        .field_with("join_date", "join_date", Fallback::SyncTime)
        .same("status")
        .build()
}

pub fn users() -> Result<CollectionMapping, SchemaError> {
    CollectionMapping::builder("users", tables::users()?)
        .same("email")
        .field("displayName", "display_name")
        .same("institution")
        .same("role")
        .same("status")
        .field("treeTrackingNumber", "tree_tracking_number")
        .field("createdAt", "created_at")
        .field("approvedAt", "approved_at")
        .build()
}

pub fn trees() -> Result<CollectionMapping, SchemaError> {
    let mut builder = CollectionMapping::builder("trees", tables::trees()?)
        .key_rule(KeyRule::FieldOrDocumentId("tree_id".to_string()));

    for column in [
        "form_uuid",
        "tree_tracking_number",
        "institution",
        "local_name",
        "scientific_name",
        "planter_id",
        "planters_name",
        "planter_email",
        "planter_uid",
        "date_planted",
        "tree_stage",
        "rcd_cm",
        "dbh_cm",
        "height_m",
        "co2_kg",
        "status",
        "qr_code",
        "kobo_submission_id",
    ] {
        builder = builder.same(column);
    }
    builder = builder.field_with("last_updated", "last_updated", Fallback::SyncTime);
    for column in [
        "country",
        "county",
        "sub_county",
        "ward",
        "adopter_name",
        "organization_name",
        "latitude",
        "longitude",
    ] {
        builder = builder.same(column);
    }
    builder.build()
}

/// Mapping for a collection by name
pub fn for_collection(collection: &str) -> Result<Option<CollectionMapping>, SchemaError> {
    let mapping = match collection {
        "institutions" => institutions()?,
        "users" => users()?,
        "trees" => trees()?,
        _ => return Ok(None),
    };
    Ok(Some(mapping))
}
