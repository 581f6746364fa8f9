//! Index registry of a collection and the `where` optimizer.
//!
//! Indexes are kept in sync with the visible state from change events.
//! Lazy indexes are built on first use or when the collection becomes ready.

use crate::compare::CompareOptions;
use crate::expression::{as_field_predicate, Expr};
use crate::index::{BTreeIndex, IndexQuery, IndexStats};
use crate::state::StateManager;
use crate::{ChangeMessage, ChangeType, Key};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Ordering clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBy {
    pub expression: Expr,
    #[serde(default)]
    pub options: CompareOptions,
}

impl OrderBy {
    pub fn asc(expression: Expr) -> Self {
        Self {
            expression,
            options: CompareOptions::default(),
        }
    }

    pub fn desc(expression: Expr) -> Self {
        Self {
            expression,
            options: CompareOptions::descending(),
        }
    }

    pub fn with_options(mut self, options: CompareOptions) -> Self {
        self.options = options;
        self
    }
}

/// Automatic index creation for subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoIndex {
    Off,
    /// Index every single-field predicate of a subscription's `where`.
    #[default]
    Eager,
}

/// When an index is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexResolver {
    /// Build from the current items at creation.
    #[default]
    Eager,
    /// Build once, on first use or when the collection becomes ready.
    Lazy,
}

/// Options for [`crate::Collection::create_index`].
#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    pub name: Option<String>,
    pub compare: CompareOptions,
    pub resolver: IndexResolver,
}

impl IndexOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_compare(mut self, compare: CompareOptions) -> Self {
        self.compare = compare;
        self
    }

    pub fn lazy(mut self) -> Self {
        self.resolver = IndexResolver::Lazy;
        self
    }
}

/// Public description of a registered index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexInfo {
    pub id: u64,
    pub name: Option<String>,
    pub expression: Expr,
    pub compare: CompareOptions,
    pub built: bool,
    pub auto: bool,
    pub stats: IndexStats,
}

struct ManagedIndex {
    index: BTreeIndex,
    built: bool,
    auto: bool,
}

#[derive(Default)]
pub(crate) struct IndexManager {
    next_id: u64,
    indexes: BTreeMap<u64, ManagedIndex>,
}

impl IndexManager {
    /// Register an index. Eager indexes are built from `state` immediately.
    pub fn create(&mut self, expression: Expr, options: IndexOptions, state: &StateManager) -> u64 {
        self.insert(expression, options, false, state)
    }

    fn insert(
        &mut self,
        expression: Expr,
        options: IndexOptions,
        auto: bool,
        state: &StateManager,
    ) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        let mut managed = ManagedIndex {
            index: BTreeIndex::new(id.to_string(), options.name, expression, options.compare),
            built: false,
            auto,
        };
        if options.resolver == IndexResolver::Eager {
            build(&mut managed, state);
        }
        self.indexes.insert(id, managed);
        id
    }

    pub fn remove(&mut self, id: u64) -> bool {
        self.indexes.remove(&id).is_some()
    }

    pub fn get(&self, id: u64) -> Option<&dyn IndexQuery> {
        self.indexes.get(&id).map(|m| &m.index as &dyn IndexQuery)
    }

    pub fn info(&self) -> Vec<IndexInfo> {
        self.indexes
            .iter()
            .map(|(id, m)| IndexInfo {
                id: *id,
                name: m.index.name().map(str::to_string),
                expression: m.index.expression().clone(),
                compare: m.index.compare_options(),
                built: m.built,
                auto: m.auto,
                stats: m.index.stats(),
            })
            .collect()
    }

    /// Build every lazy index that has not been built yet.
    pub fn resolve_all(&mut self, state: &StateManager) {
        for managed in self.indexes.values_mut() {
            if !managed.built {
                build(managed, state);
            }
        }
    }

    /// Make sure `id` is built, returning whether it exists.
    pub fn ensure_built(&mut self, id: u64, state: &StateManager) -> bool {
        match self.indexes.get_mut(&id) {
            Some(managed) => {
                if !managed.built {
                    build(managed, state);
                }
                true
            }
            None => false,
        }
    }

    /// Apply visible changes to built indexes.
    pub fn update(&mut self, changes: &[ChangeMessage]) {
        for managed in self.indexes.values_mut().filter(|m| m.built) {
            for change in changes {
                match change.change_type {
                    ChangeType::Insert => managed.index.add(&change.key, &change.value),
                    ChangeType::Update => managed.index.update(&change.key, &change.value),
                    ChangeType::Delete => managed.index.remove(&change.key),
                }
            }
        }
    }

    /// Rebuild every built index from `state`.
    pub fn rebuild(&mut self, state: &StateManager) {
        for managed in self.indexes.values_mut().filter(|m| m.built) {
            build(managed, state);
        }
    }

    /// An index on `path` that orders values the way `where` evaluation
    /// does. The flag marks a descending index, whose range operators
    /// must be mirrored.
    fn find_predicate_index(&self, path: &[String]) -> Option<(u64, bool)> {
        let evaluator = CompareOptions::default();
        self.indexes.iter().find_map(|(id, m)| {
            let options = m.index.compare_options();
            (m.index.matches_field(path) && options.string_sort == evaluator.string_sort)
                .then(|| (*id, options.direction != evaluator.direction))
        })
    }

    /// Create `auto:<path>` indexes for the single-field predicates of `expr`
    /// that no index covers yet. Returns the new index ids and names.
    pub fn ensure_auto_indexes(&mut self, expr: &Expr, state: &StateManager) -> Vec<(u64, String)> {
        let mut created = Vec::new();
        for predicate in expr.field_predicates() {
            if self.find_predicate_index(&predicate.path).is_some() {
                continue;
            }
            let name = format!("auto:{}", predicate.path.join("."));
            let id = self.insert(
                Expr::Ref {
                    path: predicate.path,
                },
                IndexOptions::named(name.clone()),
                true,
                state,
            );
            tracing::debug!(index = %name, "created automatic index");
            created.push((id, name));
        }
        created
    }

    /// Build lazy indexes that `expr` could use.
    pub fn prepare_for(&mut self, expr: &Expr, state: &StateManager) {
        for predicate in expr.field_predicates() {
            if let Some((id, _)) = self.find_predicate_index(&predicate.path) {
                self.ensure_built(id, state);
            }
        }
    }

    /// Resolve `expr` to a key set using indexes alone.
    ///
    /// `and` intersects and `or` unites, each only when every operand is
    /// answerable. Returns `None` when any needed index is missing.
    pub fn optimize(&self, expr: &Expr) -> Option<BTreeSet<Key>> {
        let Expr::Func { name, args } = expr else {
            return None;
        };
        match name.as_str() {
            "and" => {
                let mut sets = args.iter().map(|a| self.optimize(a));
                let first = sets.next()??;
                sets.try_fold(first, |acc, next| {
                    next.map(|set| acc.intersection(&set).cloned().collect())
                })
            }
            "or" => args.iter().try_fold(BTreeSet::new(), |mut acc, arg| {
                acc.extend(self.optimize(arg)?);
                Some(acc)
            }),
            _ => {
                let predicate = as_field_predicate(name, args)?;
                let (id, descending) = self.find_predicate_index(&predicate.path)?;
                let managed = self.indexes.get(&id)?;
                if !managed.built || !managed.index.supports(predicate.op) {
                    return None;
                }
                let op = if descending {
                    predicate.op.mirrored().unwrap_or(predicate.op)
                } else {
                    predicate.op
                };
                Some(managed.index.lookup(op, &predicate.value))
            }
        }
    }

    /// Index usable for `order_by`, built on demand. The flag reports
    /// whether the index runs in the opposite direction.
    pub fn order_index(&mut self, order_by: &OrderBy, state: &StateManager) -> Option<(u64, bool)> {
        let (id, reversed) = self.indexes.iter().find_map(|(id, m)| {
            let options = m.index.compare_options();
            (m.index.expression() == &order_by.expression
                && options.matches_ignoring_direction(&order_by.options))
            .then(|| (*id, options.direction != order_by.options.direction))
        })?;
        self.ensure_built(id, state);
        Some((id, reversed))
    }
}

fn build(managed: &mut ManagedIndex, state: &StateManager) {
    let entries = state.entries();
    managed.index.build(entries.iter().map(|(k, v)| (k, v)));
    managed.built = true;
}
