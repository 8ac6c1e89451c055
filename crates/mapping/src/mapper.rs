//! Declarative field mappings between the unified schema and vendor schemas.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use erpbridge_core::EntityKind;

use crate::error::MappingError;
use crate::path::{FieldPath, kind_of};

/// Name of the vendor-agnostic schema every connector maps to and from.
pub const UNIFIED_SCHEMA: &str = "unified";

pub type TransformFn = Arc<dyn Fn(&JsonValue) -> Result<JsonValue, MappingError> + Send + Sync>;
pub type DefaultFn = Arc<dyn Fn() -> JsonValue + Send + Sync>;

/// Fallback used when a source value is undefined.
#[derive(Clone)]
pub enum DefaultValue {
    Value(JsonValue),
    /// Called only when the value is otherwise undefined.
    Factory(DefaultFn),
}

impl DefaultValue {
    fn produce(&self) -> JsonValue {
        match self {
            DefaultValue::Value(v) => v.clone(),
            DefaultValue::Factory(f) => f(),
        }
    }
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::Value(v) => f.debug_tuple("Value").field(v).finish(),
            DefaultValue::Factory(_) => f.write_str("Factory(..)"),
        }
    }
}

/// One `source_path -> target_path` rule.
#[derive(Clone)]
pub struct FieldMapping {
    source_path: FieldPath,
    target_path: FieldPath,
    transform: Option<TransformFn>,
    required: bool,
    default: Option<DefaultValue>,
    /// Set on inferred reverse rules whose forward rule had a transform.
    needs_reverse_transform: bool,
}

impl FieldMapping {
    pub fn new(source_path: &str, target_path: &str) -> Result<Self, MappingError> {
        Ok(Self {
            source_path: FieldPath::parse(source_path)?,
            target_path: FieldPath::parse(target_path)?,
            transform: None,
            required: false,
            default: None,
            needs_reverse_transform: false,
        })
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: JsonValue) -> Self {
        self.default = Some(DefaultValue::Value(value));
        self
    }

    pub fn with_default_fn<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> JsonValue + Send + Sync + 'static,
    {
        self.default = Some(DefaultValue::Factory(Arc::new(factory)));
        self
    }

    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(&JsonValue) -> Result<JsonValue, MappingError> + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self.needs_reverse_transform = false;
        self
    }

    pub fn source_path(&self) -> &FieldPath {
        &self.source_path
    }

    pub fn target_path(&self) -> &FieldPath {
        &self.target_path
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn has_transform(&self) -> bool {
        self.transform.is_some()
    }

    /// Swap paths for the inferred reverse direction. Transforms are not invertible,
    /// so the rule only remembers that one is needed.
    fn inverted(&self) -> Self {
        Self {
            source_path: self.target_path.clone(),
            target_path: self.source_path.clone(),
            transform: None,
            required: false,
            default: None,
            needs_reverse_transform: self.transform.is_some(),
        }
    }

    /// Source value after transform and default; `None` means undefined.
    fn resolve(&self, data: &JsonValue) -> Result<Option<JsonValue>, MappingError> {
        let value = match self.source_path.get(data) {
            Some(raw) => match &self.transform {
                Some(f) => Some(f(raw)?),
                None if self.needs_reverse_transform => {
                    return Err(MappingError::MissingReverseTransform {
                        path: self.source_path.to_string(),
                    });
                }
                None => Some(raw.clone()),
            },
            None => None,
        };

        Ok(value.or_else(|| self.default.as_ref().map(DefaultValue::produce)))
    }
}

impl fmt::Debug for FieldMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldMapping")
            .field("source_path", &self.source_path)
            .field("target_path", &self.target_path)
            .field("transform", &self.transform.is_some())
            .field("required", &self.required)
            .field("default", &self.default)
            .field("needs_reverse_transform", &self.needs_reverse_transform)
            .finish()
    }
}

/// All field rules for one `(source, target, entity kind)` triple.
#[derive(Debug, Clone)]
pub struct MappingDefinition {
    pub source_schema: String,
    pub target_schema: String,
    pub entity_kind: EntityKind,
    pub fields: Vec<FieldMapping>,
    /// Derived from the opposite direction rather than defined explicitly.
    pub inferred: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MappingKey {
    source: String,
    target: String,
    entity_kind: EntityKind,
}

impl MappingKey {
    fn new(source: &str, target: &str, entity_kind: EntityKind) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            entity_kind,
        }
    }
}

/// Registry of mapping definitions; cheap to share behind an `Arc`.
#[derive(Debug, Default)]
pub struct SchemaMapper {
    definitions: RwLock<HashMap<MappingKey, MappingDefinition>>,
}

impl SchemaMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the rules for `source -> target`.
    ///
    /// When `target` is [`UNIFIED_SCHEMA`] the reverse `unified -> source` rules are
    /// inferred too, unless an explicit reverse definition already exists.
    pub fn define_mapping(
        &self,
        source: &str,
        target: &str,
        entity_kind: EntityKind,
        fields: Vec<FieldMapping>,
    ) {
        let mut defs = self.definitions.write().unwrap_or_else(PoisonError::into_inner);

        if target == UNIFIED_SCHEMA && source != UNIFIED_SCHEMA {
            let reverse_key = MappingKey::new(target, source, entity_kind);
            let explicit_reverse = defs.get(&reverse_key).is_some_and(|d| !d.inferred);
            if !explicit_reverse {
                defs.insert(
                    reverse_key,
                    MappingDefinition {
                        source_schema: target.to_string(),
                        target_schema: source.to_string(),
                        entity_kind,
                        fields: fields.iter().map(FieldMapping::inverted).collect(),
                        inferred: true,
                    },
                );
            }
        }

        debug!(from_schema = source, to_schema = target, entity_kind = %entity_kind, fields = fields.len(), "mapping defined");
        defs.insert(
            MappingKey::new(source, target, entity_kind),
            MappingDefinition {
                source_schema: source.to_string(),
                target_schema: target.to_string(),
                entity_kind,
                fields,
                inferred: false,
            },
        );
    }

    /// Attach a transform to the inferred reverse of the forward rule
    /// `source -> target` whose target path is `forward_target_path`.
    pub fn register_reverse_transform<F>(
        &self,
        source: &str,
        target: &str,
        entity_kind: EntityKind,
        forward_target_path: &str,
        transform: F,
    ) -> Result<(), MappingError>
    where
        F: Fn(&JsonValue) -> Result<JsonValue, MappingError> + Send + Sync + 'static,
    {
        let path = FieldPath::parse(forward_target_path)?;
        let mut defs = self.definitions.write().unwrap_or_else(PoisonError::into_inner);
        let reverse = defs
            .get_mut(&MappingKey::new(target, source, entity_kind))
            .ok_or_else(|| not_found(target, source, entity_kind))?;

        let field = reverse
            .fields
            .iter_mut()
            .find(|f| f.source_path == path)
            .ok_or_else(|| MappingError::InvalidPath {
                path: forward_target_path.to_string(),
                reason: format!("no rule reads this path in {target} -> {source}"),
            })?;
        field.transform = Some(Arc::new(transform));
        field.needs_reverse_transform = false;
        Ok(())
    }

    pub fn has_mapping(&self, source: &str, target: &str, entity_kind: EntityKind) -> bool {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&MappingKey::new(source, target, entity_kind))
    }

    pub fn definition(&self, source: &str, target: &str, entity_kind: EntityKind) -> Option<MappingDefinition> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&MappingKey::new(source, target, entity_kind))
            .cloned()
    }

    pub fn clear(&self) {
        self.definitions.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Map one record. The result is always an object holding only mapped fields.
    pub fn transform(
        &self,
        source: &str,
        target: &str,
        entity_kind: EntityKind,
        data: &JsonValue,
    ) -> Result<JsonValue, MappingError> {
        let def = self.lookup(source, target, entity_kind)?;
        apply(&def, data)
    }

    /// Map every element of a JSON array (or a slice of records).
    pub fn transform_array(
        &self,
        source: &str,
        target: &str,
        entity_kind: EntityKind,
        items: &[JsonValue],
    ) -> Result<Vec<JsonValue>, MappingError> {
        let def = self.lookup(source, target, entity_kind)?;
        items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                apply(&def, item).map_err(|e| MappingError::Item {
                    index,
                    source: Box::new(e),
                })
            })
            .collect()
    }

    /// Check that every required rule has a value (or default) without mapping.
    pub fn validate(
        &self,
        source: &str,
        target: &str,
        entity_kind: EntityKind,
        data: &JsonValue,
    ) -> Result<(), MappingError> {
        let def = self.lookup(source, target, entity_kind)?;
        let missing: Vec<String> = def
            .fields
            .iter()
            .filter(|f| f.required && f.default.is_none() && f.source_path.get(data).is_none())
            .map(|f| f.source_path.to_string())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(MappingError::MissingRequired { paths: missing })
        }
    }

    /// `schema -> unified` shorthand.
    pub fn to_unified(&self, schema: &str, entity_kind: EntityKind, data: &JsonValue) -> Result<JsonValue, MappingError> {
        self.transform(schema, UNIFIED_SCHEMA, entity_kind, data)
    }

    /// `unified -> schema` shorthand.
    pub fn from_unified(&self, schema: &str, entity_kind: EntityKind, data: &JsonValue) -> Result<JsonValue, MappingError> {
        self.transform(UNIFIED_SCHEMA, schema, entity_kind, data)
    }

    fn lookup(&self, source: &str, target: &str, entity_kind: EntityKind) -> Result<MappingDefinition, MappingError> {
        self.definition(source, target, entity_kind)
            .ok_or_else(|| not_found(source, target, entity_kind))
    }
}

fn apply(def: &MappingDefinition, data: &JsonValue) -> Result<JsonValue, MappingError> {
    if !matches!(data, JsonValue::Object(_) | JsonValue::Array(_)) {
        return Err(MappingError::UnexpectedInput {
            expected: "an object or array",
            found: kind_of(data).to_string(),
        });
    }

    let mut out = JsonValue::Object(Map::new());
    for field in &def.fields {
        match field.resolve(data)? {
            Some(value) => field.target_path.set(&mut out, value)?,
            None if field.required => {
                return Err(MappingError::RequiredFieldMissing {
                    source_path: field.source_path.to_string(),
                    target_path: field.target_path.to_string(),
                });
            }
            None => {}
        }
    }
    Ok(out)
}

fn not_found(source: &str, target: &str, entity_kind: EntityKind) -> MappingError {
    MappingError::MappingNotFound {
        from_schema: source.to_string(),
        to_schema: target.to_string(),
        entity_kind,
    }
}
