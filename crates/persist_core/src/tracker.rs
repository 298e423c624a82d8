//! Entity graph change tracking.
//!
//! # Responsibility
//! - Register an entity graph depth-first and snapshot each entity's fields.
//! - Report, per entity, its new state and current field values for
//!   synchronization consumers.
//!
//! # Invariants
//! - Tracking never mutates the entities.
//! - Every registered entity gets a distinct key within one context.
//!   Keys come from the graph key, else `<kind>:<id>`, else a per-build
//!   `~tmp-<n>` placeholder.
//! - Graph keys may not use the `~tmp-` placeholder namespace.
//! - Entities whose current state is `None` get no field entries.

use crate::model::entity::{EntityState, GraphKeyed, Identifiable, Stateful};
use crate::model::value::FieldValue;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

const TEMP_KEY_PREFIX: &str = "~tmp-";

/// An entity that can take part in change tracking.
pub trait Trackable: Identifiable + Stateful + GraphKeyed {
    /// Record kind qualifying primary-key derived keys, usually the table.
    fn kind(&self) -> &'static str;

    /// Current tracked field values.
    fn fields(&self) -> Vec<(&'static str, FieldValue)>;

    /// Directly owned child entities, in a stable order.
    fn children(&self) -> Vec<&dyn Trackable> {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackError {
    /// Two entities in one graph resolved to the same key.
    DuplicateEntityKey(String),
    /// A graph key uses the reserved placeholder namespace.
    ReservedEntityKey(String),
    /// A snapshotted entity is no longer reachable at its recorded position.
    EntityVanished { key: String, path: Vec<usize> },
}

impl Display for TrackError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateEntityKey(key) => write!(f, "duplicate entity key in graph: {key}"),
            Self::ReservedEntityKey(key) => {
                write!(f, "entity key {key} uses reserved prefix {TEMP_KEY_PREFIX}")
            }
            Self::EntityVanished { key, path } => {
                write!(f, "tracked entity {key} vanished from graph position {path:?}")
            }
        }
    }
}

impl Error for TrackError {}

pub type TrackResult<T> = Result<T, TrackError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextOptions {
    /// Leave zero/empty fields out of snapshots. Bool fields are always kept.
    pub omit_empty: bool,
}

/// Field values and state captured at registration.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySnapshot {
    pub path: Vec<usize>,
    pub fields: BTreeMap<String, FieldValue>,
    pub state: EntityState,
}

/// What the tracker reports for one entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityDiff {
    /// Set when the state changed since registration.
    pub state: Option<EntityState>,
    /// Current value of every snapshotted field.
    pub fields: BTreeMap<String, FieldValue>,
    /// Values captured at registration, for consumers needing true deltas.
    pub captured: BTreeMap<String, FieldValue>,
}

impl EntityDiff {
    /// Fields whose current value differs from the captured one.
    pub fn changed_fields(&self) -> BTreeMap<&str, &FieldValue> {
        self.fields
            .iter()
            .filter(|(name, value)| self.captured.get(name.as_str()) != Some(*value))
            .map(|(name, value)| (name.as_str(), value))
            .collect()
    }
}

/// Snapshots of one graph traversal.
#[derive(Debug, Clone, Default)]
pub struct EntityContext {
    options: ContextOptions,
    snapshots: BTreeMap<String, EntitySnapshot>,
    next_temp: usize,
}

impl EntityContext {
    pub fn build(root: &dyn Trackable) -> TrackResult<Self> {
        Self::build_with(root, ContextOptions::default())
    }

    pub fn build_with(root: &dyn Trackable, options: ContextOptions) -> TrackResult<Self> {
        let mut context = Self {
            options,
            ..Self::default()
        };
        let mut path = Vec::new();
        context.register(root, &mut path)?;
        Ok(context)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.snapshots.keys().map(String::as_str)
    }

    pub fn snapshot(&self, key: &str) -> Option<&EntitySnapshot> {
        self.snapshots.get(key)
    }

    /// Compares the current graph under `root` with the snapshots.
    ///
    /// The graph must keep the shape it had at `build`; entities are located
    /// by their registration position, not re-derived keys.
    pub fn diff(&self, root: &dyn Trackable) -> TrackResult<BTreeMap<String, EntityDiff>> {
        let mut diffs = BTreeMap::new();

        for (key, snapshot) in &self.snapshots {
            let entity = resolve(root, &snapshot.path).ok_or_else(|| TrackError::EntityVanished {
                key: key.clone(),
                path: snapshot.path.clone(),
            })?;

            let current_state = entity.state();
            let mut diff: Option<EntityDiff> = None;
            if current_state != snapshot.state {
                diff.get_or_insert_with(EntityDiff::default).state = Some(current_state);
            }

            if current_state != EntityState::None {
                let current: BTreeMap<&str, FieldValue> = entity.fields().into_iter().collect();
                let entry = diff.get_or_insert_with(EntityDiff::default);
                for (name, captured) in &snapshot.fields {
                    let value = current.get(name.as_str()).cloned().unwrap_or(FieldValue::Null);
                    entry.fields.insert(name.clone(), value);
                    entry.captured.insert(name.clone(), captured.clone());
                }
            }

            if let Some(diff) = diff {
                diffs.insert(key.clone(), diff);
            }
        }

        Ok(diffs)
    }

    fn register(&mut self, entity: &dyn Trackable, path: &mut Vec<usize>) -> TrackResult<()> {
        let key = self.derive_key(entity)?;
        if self.snapshots.contains_key(&key) {
            return Err(TrackError::DuplicateEntityKey(key));
        }

        let fields = entity
            .fields()
            .into_iter()
            .filter(|(_, value)| {
                !self.options.omit_empty || matches!(value, FieldValue::Bool(_)) || !value.is_zero()
            })
            .map(|(name, value)| (name.to_string(), value))
            .collect();
        self.snapshots.insert(
            key,
            EntitySnapshot {
                path: path.clone(),
                fields,
                state: entity.state(),
            },
        );

        for (index, child) in entity.children().into_iter().enumerate() {
            path.push(index);
            self.register(child, path)?;
            path.pop();
        }
        Ok(())
    }

    fn derive_key(&mut self, entity: &dyn Trackable) -> TrackResult<String> {
        if let Some(key) = entity.entity_key().filter(|key| !key.is_empty()) {
            if key.starts_with(TEMP_KEY_PREFIX) {
                return Err(TrackError::ReservedEntityKey(key.to_string()));
            }
            return Ok(key.to_string());
        }
        let id = entity.id();
        if id.is_set() {
            return Ok(format!("{}:{}", entity.kind(), id));
        }
        let key = format!("{TEMP_KEY_PREFIX}{}", self.next_temp);
        self.next_temp += 1;
        Ok(key)
    }
}

fn resolve<'a>(root: &'a dyn Trackable, path: &[usize]) -> Option<&'a dyn Trackable> {
    let mut current = root;
    for index in path {
        current = current.children().into_iter().nth(*index)?;
    }
    Some(current)
}
