//! Encryption schema compilation.
//!
//! An encryption schema is a JSON tree mirroring the document shape:
//!
//! ```json
//! {
//!   "bsonType": "object",
//!   "encryptMetadata": { "keyId": "6c8c0a4e-..." },
//!   "properties": {
//!     "ssn":       { "encrypt": { "bsonType": "int", "algorithm": "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic" } },
//!     "bloodType": { "encrypt": { "bsonType": "string", "algorithm": "AEAD_AES_256_CBC_HMAC_SHA_512-Random" } },
//!     "insurance": { "bsonType": "object", "properties": { "policyNumber": { "encrypt": { "bsonType": "int" } } } }
//!   }
//! }
//! ```
//!
//! [`compile`] flattens it once into a [`CompiledSchema`] so that document
//! walks resolve directives by path instead of re-interpreting the tree.
//! Only encryption keywords are accepted; any other keyword is rejected.

use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{Map, Value as Json};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Encryption algorithm selected by a directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// Same plaintext and key always produce the same ciphertext.
    Deterministic,
    /// Every encryption draws a fresh IV.
    Random,
}

impl Algorithm {
    /// Full algorithm name as written in schemas.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Deterministic => "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic",
            Self::Random => "AEAD_AES_256_CBC_HMAC_SHA_512-Random",
        }
    }

    /// Wire identifier stored in the ciphertext envelope.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Deterministic => 1,
            Self::Random => 2,
        }
    }

    /// Parses the wire identifier.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Deterministic),
            2 => Some(Self::Random),
            _ => None,
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic" | "Deterministic" => {
                Some(Self::Deterministic)
            }
            "AEAD_AES_256_CBC_HMAC_SHA_512-Random" | "Random" => Some(Self::Random),
            _ => None,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Declared type of an encrypted field (`bsonType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// `string`
    String,
    /// `int` (32-bit)
    Int,
    /// `long` (64-bit)
    Long,
    /// `double`
    Double,
    /// `bool`
    Bool,
    /// `date`
    Date,
    /// `binData`
    BinData,
    /// `object`
    Object,
    /// `array`
    Array,
}

impl ValueType {
    /// Schema spelling of the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Long => "long",
            Self::Double => "double",
            Self::Bool => "bool",
            Self::Date => "date",
            Self::BinData => "binData",
            Self::Object => "object",
            Self::Array => "array",
        }
    }

    /// Parses a `bsonType` name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "string" => Self::String,
            "int" => Self::Int,
            "long" => Self::Long,
            "double" => Self::Double,
            "bool" => Self::Bool,
            "date" => Self::Date,
            "binData" => Self::BinData,
            "object" => Self::Object,
            "array" => Self::Array,
            _ => return None,
        })
    }

    /// Whether deterministic encryption may be declared for this type.
    ///
    /// Floating point, boolean and container types are excluded: they either
    /// lack a single canonical form or have too few distinct values for
    /// equality-preserving ciphertext to be meaningful.
    #[must_use]
    pub const fn supports_deterministic(self) -> bool {
        matches!(self, Self::String | Self::Int | Self::Long | Self::Date | Self::BinData)
    }
}

/// How a single field is encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Directive {
    /// Data key used for this field.
    pub key_id: Uuid,
    /// Cipher mode.
    pub algorithm: Algorithm,
    /// Declared type; always present for deterministic directives.
    pub value_type: Option<ValueType>,
}

/// Path of a field from the document root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Path segments.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl<S: Into<String>> FromIterator<S> for FieldPath {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Flattened, path-indexed encryption schema.
#[derive(Debug, Clone, Default)]
pub struct CompiledSchema {
    directives: HashMap<Vec<String>, Directive>,
    objects: HashSet<Vec<String>>,
}

impl CompiledSchema {
    /// Directive for the field at `path`, if the field is encrypted.
    #[must_use]
    pub fn directive(&self, path: &[String]) -> Option<&Directive> {
        self.directives.get(path)
    }

    /// Whether `path` is a sub-document containing encrypted fields.
    #[must_use]
    pub fn is_object(&self, path: &[String]) -> bool {
        self.objects.contains(path)
    }

    /// All directives, in path order.
    #[must_use]
    pub fn directives(&self) -> Vec<(FieldPath, Directive)> {
        let mut all: Vec<_> =
            self.directives.iter().map(|(p, d)| (FieldPath(p.clone()), *d)).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Every key id referenced by the schema.
    #[must_use]
    pub fn key_ids(&self) -> BTreeSet<Uuid> {
        self.directives.values().map(|d| d.key_id).collect()
    }

    /// Number of encrypted fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.directives.len()
    }

    /// Returns `true` if the schema encrypts nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }

    fn record(&mut self, path: &[String], directive: Directive) {
        for depth in 1..path.len() {
            self.objects.insert(path[..depth].to_vec());
        }
        self.directives.insert(path.to_vec(), directive);
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Defaults {
    key_id: Option<Uuid>,
    algorithm: Option<Algorithm>,
}

/// Compiles an encryption schema.
///
/// # Errors
///
/// Returns `Error::Schema` if the schema uses unknown keywords, declares a
/// deterministic directive without a suitable type, places directives inside
/// array items, or leaves a directive without a resolvable key id.
pub fn compile(schema: &Json) -> Result<CompiledSchema> {
    let node = as_object(schema, "")?;
    if node.contains_key("encrypt") || node.contains_key("items") {
        return Err(Error::Schema("the schema root must describe an object".into()));
    }
    let mut compiled = CompiledSchema::default();
    compile_node(node, &mut Vec::new(), Defaults::default(), false, &mut compiled)?;
    Ok(compiled)
}

fn compile_node(
    node: &Map<String, Json>,
    path: &mut Vec<String>,
    inherited: Defaults,
    in_array: bool,
    out: &mut CompiledSchema,
) -> Result<()> {
    for key in node.keys() {
        if !matches!(
            key.as_str(),
            "bsonType" | "properties" | "encryptMetadata" | "encrypt" | "items"
        ) {
            return Err(Error::Schema(format!("unsupported keyword `{key}` at `{}`", show(path))));
        }
    }

    let defaults = match node.get("encryptMetadata") {
        Some(meta) => parse_metadata(meta, path, inherited)?,
        None => inherited,
    };
    let declared = node.get("bsonType").map(|t| parse_type(t, path)).transpose()?;

    if let Some(encrypt) = node.get("encrypt") {
        if node.contains_key("properties") || node.contains_key("items") {
            return Err(Error::Schema(format!(
                "`encrypt` cannot be combined with `properties` or `items` at `{}`",
                show(path)
            )));
        }
        if in_array {
            return Err(Error::Schema(format!(
                "per-element directive at `{}`: encrypt the whole array with Random instead",
                show(path)
            )));
        }
        let directive = parse_directive(encrypt, path, defaults, declared)?;
        out.record(path, directive);
        return Ok(());
    }

    if let Some(properties) = node.get("properties") {
        if !matches!(declared, None | Some(ValueType::Object)) {
            return Err(Error::Schema(format!(
                "`properties` requires bsonType `object` at `{}`",
                show(path)
            )));
        }
        for (name, child) in as_object(properties, &show(path))? {
            path.push(name.clone());
            let child = as_object(child, &show(path))?;
            compile_node(child, path, defaults, in_array, out)?;
            path.pop();
        }
    }

    if let Some(items) = node.get("items") {
        if !matches!(declared, None | Some(ValueType::Array)) {
            return Err(Error::Schema(format!(
                "`items` requires bsonType `array` at `{}`",
                show(path)
            )));
        }
        let item_schemas = match items {
            Json::Array(list) => list.iter().collect::<Vec<_>>(),
            single => vec![single],
        };
        for item in item_schemas {
            compile_node(as_object(item, &show(path))?, path, defaults, true, out)?;
        }
    }

    Ok(())
}

fn parse_metadata(meta: &Json, path: &[String], inherited: Defaults) -> Result<Defaults> {
    let meta = as_object(meta, &show(path))?;
    let mut defaults = inherited;
    for (key, value) in meta {
        match key.as_str() {
            "keyId" => defaults.key_id = Some(parse_key_id(value, path)?),
            "algorithm" => defaults.algorithm = Some(parse_algorithm(value, path)?),
            other => {
                return Err(Error::Schema(format!(
                    "unsupported keyword `{other}` in encryptMetadata at `{}`",
                    show(path)
                )))
            }
        }
    }
    Ok(defaults)
}

fn parse_directive(
    encrypt: &Json,
    path: &[String],
    defaults: Defaults,
    sibling_type: Option<ValueType>,
) -> Result<Directive> {
    let encrypt = as_object(encrypt, &show(path))?;
    let mut key_id = None;
    let mut algorithm = None;
    let mut value_type = None;
    for (key, value) in encrypt {
        match key.as_str() {
            "keyId" => key_id = Some(parse_key_id(value, path)?),
            "algorithm" => algorithm = Some(parse_algorithm(value, path)?),
            "bsonType" => value_type = Some(parse_type(value, path)?),
            other => {
                return Err(Error::Schema(format!(
                    "unsupported keyword `{other}` in encrypt at `{}`",
                    show(path)
                )))
            }
        }
    }

    let value_type = match (value_type, sibling_type) {
        (Some(inner), Some(outer)) if inner != outer => {
            return Err(Error::Schema(format!(
                "conflicting bsonType `{}` and `{}` at `{}`",
                outer.as_str(),
                inner.as_str(),
                show(path)
            )))
        }
        (inner, outer) => inner.or(outer),
    };

    let key_id = key_id.or(defaults.key_id).ok_or_else(|| {
        Error::Schema(format!("no keyId for `{}` and no encryptMetadata default", show(path)))
    })?;
    let algorithm = algorithm.or(defaults.algorithm).ok_or_else(|| {
        Error::Schema(format!("no algorithm for `{}`", show(path)))
    })?;

    if algorithm == Algorithm::Deterministic {
        match value_type {
            None => {
                return Err(Error::Schema(format!(
                    "deterministic encryption of `{}` requires a bsonType",
                    show(path)
                )))
            }
            Some(ValueType::Array) => {
                return Err(Error::Schema(format!(
                    "array field `{}` must use Random encryption",
                    show(path)
                )))
            }
            Some(t) if !t.supports_deterministic() => {
                return Err(Error::Schema(format!(
                    "bsonType `{}` cannot be encrypted deterministically at `{}`",
                    t.as_str(),
                    show(path)
                )))
            }
            Some(_) => {}
        }
    }

    Ok(Directive { key_id, algorithm, value_type })
}

fn parse_algorithm(value: &Json, path: &[String]) -> Result<Algorithm> {
    value.as_str().and_then(Algorithm::parse).ok_or_else(|| {
        Error::Schema(format!("unknown algorithm {value} at `{}`", show(path)))
    })
}

fn parse_type(value: &Json, path: &[String]) -> Result<ValueType> {
    value.as_str().and_then(ValueType::parse).ok_or_else(|| {
        Error::Schema(format!("unsupported bsonType {value} at `{}`", show(path)))
    })
}

/// Accepts a UUID string, `{"$uuid": ...}`, `{"$binary": {"base64", "subType": "04"}}`
/// or a one-element array of any of these.
fn parse_key_id(value: &Json, path: &[String]) -> Result<Uuid> {
    let invalid = || Error::Schema(format!("invalid keyId {value} at `{}`", show(path)));
    match value {
        Json::String(s) => Uuid::parse_str(s).map_err(|_| invalid()),
        Json::Array(list) if list.len() == 1 => parse_key_id(&list[0], path),
        Json::Object(obj) if obj.len() == 1 => {
            if let Some(Json::String(s)) = obj.get("$uuid") {
                return Uuid::parse_str(s).map_err(|_| invalid());
            }
            let binary = obj.get("$binary").and_then(Json::as_object).ok_or_else(invalid)?;
            let sub_type = binary.get("subType").and_then(Json::as_str);
            if !matches!(sub_type, Some("04" | "4")) {
                return Err(invalid());
            }
            let encoded = binary.get("base64").and_then(Json::as_str).ok_or_else(invalid)?;
            let bytes = STANDARD.decode(encoded).map_err(|_| invalid())?;
            Uuid::from_slice(&bytes).map_err(|_| invalid())
        }
        _ => Err(invalid()),
    }
}

fn as_object<'a>(value: &'a Json, at: &str) -> Result<&'a Map<String, Json>> {
    value
        .as_object()
        .ok_or_else(|| Error::Schema(format!("expected a JSON object at `{at}`, found {value}")))
}

fn show(path: &[String]) -> String {
    if path.is_empty() {
        "<root>".to_string()
    } else {
        path.join(".")
    }
}

/// Compiled schemas keyed by namespace (`"database.collection"`).
#[derive(Debug, Clone, Default)]
pub struct SchemaMap {
    schemas: HashMap<String, Arc<CompiledSchema>>,
}

impl SchemaMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles every schema of a `{ namespace: schema }` JSON object.
    ///
    /// # Errors
    ///
    /// Returns `Error::Schema` naming the namespace whose schema failed.
    pub fn from_json(map: &Json) -> Result<Self> {
        let mut schemas = Self::new();
        for (namespace, schema) in as_object(map, "<schema map>")? {
            schemas.insert(namespace.clone(), schema)?;
        }
        Ok(schemas)
    }

    /// Compiles and registers a schema for `namespace`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Schema` if compilation fails.
    pub fn insert(&mut self, namespace: impl Into<String>, schema: &Json) -> Result<()> {
        let namespace = namespace.into();
        let compiled = compile(schema)
            .map_err(|e| Error::Schema(format!("namespace `{namespace}`: {e}")))?;
        self.schemas.insert(namespace, Arc::new(compiled));
        Ok(())
    }

    /// Schema registered for `namespace`.
    #[must_use]
    pub fn get(&self, namespace: &str) -> Option<Arc<CompiledSchema>> {
        self.schemas.get(namespace).cloned()
    }

    /// Number of namespaces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// Returns `true` if no namespace has a schema.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
