//! Schema definition, validation and compatibility.
//!
//! Schemas define the structure of collections, validate documents before
//! they are written, and decide whether two replicas can safely sync.

use crate::query::structural_hash;
use crate::{error::Result, CollectionName, Error, SchemaVersion, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    /// ISO-8601 string or epoch milliseconds
    Date,
    /// Nested object
    Record,
    /// Arbitrary value
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Number => write!(f, "Number"),
            FieldType::Boolean => write!(f, "Boolean"),
            FieldType::Date => write!(f, "Date"),
            FieldType::Record => write!(f, "Record"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a field in a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    pub required: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Validate a value against this field definition.
    pub fn validate(&self, value: Option<&Value>) -> Result<()> {
        match value {
            None | Some(Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            None | Some(Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => matches!(value, Value::String(_)),
            FieldType::Number => matches!(value, Value::Number(_)),
            FieldType::Boolean => matches!(value, Value::Bool(_)),
            FieldType::Date => matches!(value, Value::Date(_) | Value::String(_) | Value::Number(_)),
            FieldType::Record => matches!(value, Value::Object(_)),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: value.type_name().to_string(),
            })
        }
    }
}

/// Schema for a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSchema {
    /// Collection name
    pub name: CollectionName,
    /// Field definitions
    pub fields: Vec<FieldDef>,
}

impl CollectionSchema {
    pub fn new(name: impl Into<CollectionName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Validate a document against this schema. Fields not in the schema
    /// are allowed.
    pub fn validate_document(&self, document: &Value) -> Result<()> {
        let obj = document.as_object().ok_or_else(|| {
            Error::InvalidValue(format!(
                "{} document must be an object, got {}",
                self.name,
                document.type_name()
            ))
        })?;

        for field in &self.fields {
            field.validate(obj.get(&field.name))?;
        }

        Ok(())
    }
}

/// Schema for the entire database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Schema version for migrations
    pub version: SchemaVersion,
    /// Collection schemas by name
    pub collections: BTreeMap<CollectionName, CollectionSchema>,
}

impl Schema {
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            collections: BTreeMap::new(),
        }
    }

    pub fn add_collection(&mut self, collection: CollectionSchema) -> &mut Self {
        self.collections.insert(collection.name.clone(), collection);
        self
    }

    /// Builder-style method to add a collection.
    pub fn with_collection(mut self, collection: CollectionSchema) -> Self {
        self.add_collection(collection);
        self
    }

    pub fn get_collection(&self, name: &str) -> Option<&CollectionSchema> {
        self.collections.get(name)
    }

    /// Structural hash, stable across processes. Exchanged during the
    /// connection handshake.
    pub fn hash(&self) -> Result<String> {
        structural_hash(self)
    }

    /// Validate a document destined for `collection`.
    pub fn validate_document(&self, collection: &str, document: &Value) -> Result<()> {
        self.collections
            .get(collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?
            .validate_document(document)
    }
}

/// One difference between two schemas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SchemaEdit {
    #[serde(rename_all = "camelCase")]
    AddCollection { collection: CollectionName },
    #[serde(rename_all = "camelCase")]
    RemoveCollection { collection: CollectionName },
    #[serde(rename_all = "camelCase")]
    AddField {
        collection: CollectionName,
        field: FieldDef,
    },
    #[serde(rename_all = "camelCase")]
    RemoveField {
        collection: CollectionName,
        field: String,
    },
    #[serde(rename_all = "camelCase")]
    ChangeFieldType {
        collection: CollectionName,
        field: String,
        from: FieldType,
        to: FieldType,
    },
    #[serde(rename_all = "camelCase")]
    ChangeRequired {
        collection: CollectionName,
        field: String,
        required: bool,
    },
}

impl SchemaEdit {
    /// Whether data written under the old schema stays valid under the new.
    pub fn is_backwards_compatible(&self) -> bool {
        match self {
            SchemaEdit::AddCollection { .. } => true,
            SchemaEdit::AddField { field, .. } => !field.required,
            SchemaEdit::ChangeRequired { required, .. } => !required,
            SchemaEdit::RemoveCollection { .. }
            | SchemaEdit::RemoveField { .. }
            | SchemaEdit::ChangeFieldType { .. } => false,
        }
    }
}

/// Edits that turn `old` into `new`, in collection then field order.
pub fn diff_schemas(old: &Schema, new: &Schema) -> Vec<SchemaEdit> {
    let mut edits = Vec::new();
    for (name, before) in &old.collections {
        let Some(after) = new.collections.get(name) else {
            edits.push(SchemaEdit::RemoveCollection {
                collection: name.clone(),
            });
            continue;
        };
        for field in &before.fields {
            match after.field(&field.name) {
                None => edits.push(SchemaEdit::RemoveField {
                    collection: name.clone(),
                    field: field.name.clone(),
                }),
                Some(changed) => {
                    if changed.field_type != field.field_type {
                        edits.push(SchemaEdit::ChangeFieldType {
                            collection: name.clone(),
                            field: field.name.clone(),
                            from: field.field_type,
                            to: changed.field_type,
                        });
                    }
                    if changed.required != field.required {
                        edits.push(SchemaEdit::ChangeRequired {
                            collection: name.clone(),
                            field: field.name.clone(),
                            required: changed.required,
                        });
                    }
                }
            }
        }
        for field in &after.fields {
            if before.field(&field.name).is_none() {
                edits.push(SchemaEdit::AddField {
                    collection: name.clone(),
                    field: field.clone(),
                });
            }
        }
    }
    for name in new.collections.keys() {
        if !old.collections.contains_key(name) {
            edits.push(SchemaEdit::AddCollection {
                collection: name.clone(),
            });
        }
    }
    edits
}

/// The subset of `edits` that breaks existing data.
pub fn backwards_incompatible_edits(edits: &[SchemaEdit]) -> Vec<SchemaEdit> {
    edits
        .iter()
        .filter(|edit| !edit.is_backwards_compatible())
        .cloned()
        .collect()
}
