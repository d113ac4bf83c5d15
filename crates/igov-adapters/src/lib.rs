//! Entity/field descriptors and per-entity update strategies.

use igov_core::Candidate;
use igov_storage::{UpdateOperation, UpdateTarget};
use thiserror::Error;

pub const CRATE_NAME: &str = "igov-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldShape {
    Scalar,
    Array,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrlField {
    pub name: &'static str,
    pub shape: FieldShape,
}

impl UrlField {
    /// `avatar` for scalars, `images[]` for array slots.
    pub fn field_path(&self) -> String {
        match self.shape {
            FieldShape::Scalar => self.name.to_string(),
            FieldShape::Array => format!("{}[]", self.name),
        }
    }
}

/// Where an entity kind keeps its image URLs and which upload directory it defaults to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityDescriptor {
    pub entity_kind: &'static str,
    pub collection: &'static str,
    pub fields: &'static [UrlField],
    pub default_directory: &'static str,
}

impl EntityDescriptor {
    pub fn field_names(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.name).collect()
    }

    pub fn field_for_path(&self, field_path: &str) -> Option<&'static UrlField> {
        self.fields.iter().find(|f| f.field_path() == field_path)
    }
}

pub const USER: EntityDescriptor = EntityDescriptor {
    entity_kind: "user",
    collection: "users",
    fields: &[UrlField {
        name: "avatar",
        shape: FieldShape::Scalar,
    }],
    default_directory: "avatars",
};

pub const PET: EntityDescriptor = EntityDescriptor {
    entity_kind: "pet",
    collection: "pets",
    fields: &[UrlField {
        name: "avatar",
        shape: FieldShape::Scalar,
    }],
    default_directory: "avatars",
};

pub const POST: EntityDescriptor = EntityDescriptor {
    entity_kind: "post",
    collection: "posts",
    fields: &[UrlField {
        name: "images",
        shape: FieldShape::Array,
    }],
    default_directory: "community",
};

pub const RECORD: EntityDescriptor = EntityDescriptor {
    entity_kind: "record",
    collection: "records",
    fields: &[UrlField {
        name: "images",
        shape: FieldShape::Array,
    }],
    default_directory: "analysis",
};

/// Scan order.
pub const ENTITY_DESCRIPTORS: [EntityDescriptor; 4] = [USER, PET, POST, RECORD];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("no update strategy registered for entity kind {0:?}")]
    UnknownEntityKind(String),
    #[error("candidate for {actual:?} routed to the {expected:?} strategy")]
    EntityKindMismatch { expected: String, actual: String },
    #[error("unknown field path {field_path:?} for entity kind {entity_kind:?}")]
    UnknownField {
        entity_kind: String,
        field_path: String,
    },
    #[error("malformed document id {0:?}")]
    MalformedDocumentId(String),
    #[error("candidate does not change the stored value")]
    Unchanged,
}

pub fn validate_document_id(id: &str) -> Result<(), BuildError> {
    let valid = !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(BuildError::MalformedDocumentId(id.to_string()))
    }
}

/// Turns a previewed candidate into a store update for one entity kind.
pub trait UpdateStrategy: Send + Sync {
    fn descriptor(&self) -> &EntityDescriptor;

    fn target_for(&self, field: &UrlField, candidate: &Candidate) -> UpdateTarget;

    fn entity_kind(&self) -> &'static str {
        self.descriptor().entity_kind
    }

    fn build_operation(&self, candidate: &Candidate) -> Result<UpdateOperation, BuildError> {
        let descriptor = self.descriptor();
        let reference = &candidate.reference;
        if reference.entity_kind != descriptor.entity_kind {
            return Err(BuildError::EntityKindMismatch {
                expected: descriptor.entity_kind.to_string(),
                actual: reference.entity_kind.clone(),
            });
        }
        if !candidate.outcome.changed {
            return Err(BuildError::Unchanged);
        }
        validate_document_id(&reference.document_id)?;
        let field = descriptor
            .field_for_path(&reference.field_path)
            .ok_or_else(|| BuildError::UnknownField {
                entity_kind: reference.entity_kind.clone(),
                field_path: reference.field_path.clone(),
            })?;

        Ok(UpdateOperation {
            document_id: reference.document_id.clone(),
            field: field.name.to_string(),
            new_value: candidate.outcome.resolved_value.clone(),
            target: self.target_for(field, candidate),
        })
    }
}

/// Entity kinds whose URL fields are plain strings; last writer wins.
struct ScalarFieldStrategy {
    descriptor: EntityDescriptor,
}

impl UpdateStrategy for ScalarFieldStrategy {
    fn descriptor(&self) -> &EntityDescriptor {
        &self.descriptor
    }

    fn target_for(&self, field: &UrlField, candidate: &Candidate) -> UpdateTarget {
        match field.shape {
            FieldShape::Scalar => UpdateTarget::Scalar,
            FieldShape::Array => UpdateTarget::ArrayElement {
                expected: candidate.reference.original_value.clone(),
            },
        }
    }
}

/// Entity kinds whose URLs live in arrays; writes require the original element to still be present.
struct ArrayFieldStrategy {
    descriptor: EntityDescriptor,
}

impl UpdateStrategy for ArrayFieldStrategy {
    fn descriptor(&self) -> &EntityDescriptor {
        &self.descriptor
    }

    fn target_for(&self, _field: &UrlField, candidate: &Candidate) -> UpdateTarget {
        UpdateTarget::ArrayElement {
            expected: candidate.reference.original_value.clone(),
        }
    }
}

pub fn strategy_for_kind(entity_kind: &str) -> Option<Box<dyn UpdateStrategy>> {
    match entity_kind {
        "user" => Some(Box::new(ScalarFieldStrategy { descriptor: USER })),
        "pet" => Some(Box::new(ScalarFieldStrategy { descriptor: PET })),
        "post" => Some(Box::new(ArrayFieldStrategy { descriptor: POST })),
        "record" => Some(Box::new(ArrayFieldStrategy { descriptor: RECORD })),
        _ => None,
    }
}

/// Ordered set of strategies; scan order follows registration order.
pub struct StrategyRegistry {
    strategies: Vec<Box<dyn UpdateStrategy>>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        let strategies = ENTITY_DESCRIPTORS
            .iter()
            .filter_map(|d| strategy_for_kind(d.entity_kind))
            .collect();
        Self { strategies }
    }
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Adds a strategy, replacing any existing one for the same entity kind.
    pub fn register(mut self, strategy: Box<dyn UpdateStrategy>) -> Self {
        let kind = strategy.entity_kind();
        match self.strategies.iter().position(|s| s.entity_kind() == kind) {
            Some(idx) => self.strategies[idx] = strategy,
            None => self.strategies.push(strategy),
        }
        self
    }

    pub fn get(&self, entity_kind: &str) -> Option<&dyn UpdateStrategy> {
        self.strategies
            .iter()
            .find(|s| s.entity_kind() == entity_kind)
            .map(|s| s.as_ref())
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &EntityDescriptor> {
        self.strategies.iter().map(|s| s.descriptor())
    }

    pub fn build_operation(&self, candidate: &Candidate) -> Result<UpdateOperation, BuildError> {
        self.get(&candidate.reference.entity_kind)
            .ok_or_else(|| BuildError::UnknownEntityKind(candidate.reference.entity_kind.clone()))?
            .build_operation(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use igov_core::{NormalizationOutcome, RawReference, ReasonCode};

    fn candidate(kind: &str, id: &str, field_path: &str) -> Candidate {
        Candidate {
            reference: RawReference {
                entity_kind: kind.into(),
                document_id: id.into(),
                field_path: field_path.into(),
                original_value: "a.png".into(),
            },
            outcome: NormalizationOutcome {
                resolved_value: "http://localhost:5000/uploads/community/a.png".into(),
                reason_code: ReasonCode::UploadsPrefixAdded,
                changed: true,
            },
        }
    }

    #[test]
    fn scalar_kinds_build_plain_sets() {
        let registry = StrategyRegistry::default();
        let op = registry
            .build_operation(&candidate("user", "u1", "avatar"))
            .expect("op");
        assert_eq!(op.field, "avatar");
        assert_eq!(op.target, UpdateTarget::Scalar);
    }

    #[test]
    fn array_kinds_carry_a_precondition() {
        let registry = StrategyRegistry::default();
        let op = registry
            .build_operation(&candidate("post", "p1", "images[]"))
            .expect("op");
        assert_eq!(op.field, "images");
        assert_eq!(
            op.target,
            UpdateTarget::ArrayElement {
                expected: "a.png".into()
            }
        );
    }

    #[test]
    fn construction_errors_are_typed() {
        let registry = StrategyRegistry::default();
        assert_eq!(
            registry.build_operation(&candidate("comment", "c1", "image")),
            Err(BuildError::UnknownEntityKind("comment".into()))
        );
        assert_eq!(
            registry.build_operation(&candidate("user", "not an id!", "avatar")),
            Err(BuildError::MalformedDocumentId("not an id!".into()))
        );
        assert!(matches!(
            registry.build_operation(&candidate("post", "p1", "images")),
            Err(BuildError::UnknownField { .. })
        ));

        let mut unchanged = candidate("pet", "p1", "avatar");
        unchanged.outcome.changed = false;
        assert_eq!(registry.build_operation(&unchanged), Err(BuildError::Unchanged));
    }

    #[test]
    fn mismatched_strategy_is_rejected() {
        let strategy = strategy_for_kind("pet").expect("pet strategy");
        assert!(matches!(
            strategy.build_operation(&candidate("user", "u1", "avatar")),
            Err(BuildError::EntityKindMismatch { .. })
        ));
    }
}
