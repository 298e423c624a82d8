//! Entity lifecycle state and capability traits.
//!
//! # Responsibility
//! - Define the lifecycle tag that drives save dispatch.
//! - Define the explicit capabilities (`Identifiable`, `Stateful`,
//!   `GraphKeyed`) every persisted entity implements.
//!
//! # Invariants
//! - A `New` entity cannot be demoted to `Modified` through `set_state`
//!   before its first successful save.
//! - `None` means the entity does not participate in change tracking.

use crate::model::value::IdValue;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Lifecycle tag of an entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityState {
    /// Constructed by application code, not yet persisted.
    New,
    /// Persisted and mutated since.
    Modified,
    /// Marked for removal. Terminal.
    Deleted,
    /// Clean, or not participating in change tracking.
    #[default]
    None,
}

impl EntityState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Modified => "Modified",
            Self::Deleted => "Deleted",
            Self::None => "None",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "New" => Some(Self::New),
            "Modified" => Some(Self::Modified),
            "Deleted" => Some(Self::Deleted),
            "None" => Some(Self::None),
            _ => None,
        }
    }
}

impl Display for EntityState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bookkeeping fields shared by tracked entities.
///
/// Entity types embed this and delegate `Stateful`/`GraphKeyed` to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMeta {
    state: EntityState,
    entity_key: Option<String>,
}

impl EntityMeta {
    /// Metadata for an entity freshly built by application code.
    pub fn new_entity() -> Self {
        Self {
            state: EntityState::New,
            entity_key: None,
        }
    }

    /// Metadata for an entity loaded from storage.
    pub fn loaded() -> Self {
        Self::default()
    }

    pub fn with_entity_key(mut self, key: impl Into<String>) -> Self {
        self.entity_key = Some(key.into());
        self
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    /// Applies a state transition honoring the `New` demotion guard.
    pub fn set_state(&mut self, next: EntityState) {
        if self.state == EntityState::New && next == EntityState::Modified {
            return;
        }
        self.state = next;
    }

    pub fn force_state(&mut self, next: EntityState) {
        self.state = next;
    }

    pub fn entity_key(&self) -> Option<&str> {
        self.entity_key.as_deref().filter(|key| !key.is_empty())
    }
}

/// Access to a record's primary identity.
pub trait Identifiable {
    fn id(&self) -> IdValue;
    fn set_id(&mut self, id: IdValue);
}

/// Access to an entity's lifecycle state.
pub trait Stateful {
    fn state(&self) -> EntityState;

    /// Guarded transition; see [`EntityMeta::set_state`].
    fn set_state(&mut self, next: EntityState);

    /// Unguarded transition used once a save has committed.
    fn force_state(&mut self, next: EntityState);
}

/// Optional graph identity used by the change tracker.
///
/// Distinct from the persisted primary key; the default has none.
pub trait GraphKeyed {
    fn entity_key(&self) -> Option<&str> {
        None
    }
}
