//! Ordered indexes over collection values.
//!
//! [`BTreeIndex`] maps the value of an extractor expression to the set of
//! item keys carrying that value, ordered by [`CompareOptions`].
//! [`ReverseIndex`] presents the same storage in the opposite order.

use crate::compare::{CompareOptions, SortKey};
use crate::expression::{Comparison, Expr};
use crate::Key;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Bounds for [`IndexQuery::range_query`]. Missing bounds are open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeQuery {
    pub from: Option<Value>,
    pub to: Option<Value>,
    pub from_inclusive: bool,
    pub to_inclusive: bool,
}

impl Default for RangeQuery {
    fn default() -> Self {
        Self {
            from: None,
            to: None,
            from_inclusive: true,
            to_inclusive: true,
        }
    }
}

impl RangeQuery {
    pub fn from(mut self, value: Value, inclusive: bool) -> Self {
        self.from = Some(value);
        self.from_inclusive = inclusive;
        self
    }

    pub fn to(mut self, value: Value, inclusive: bool) -> Self {
        self.to = Some(value);
        self.to_inclusive = inclusive;
        self
    }

    /// The same range expressed in the opposite order.
    pub fn mirrored(&self) -> Self {
        Self {
            from: self.to.clone(),
            to: self.from.clone(),
            from_inclusive: self.to_inclusive,
            to_inclusive: self.from_inclusive,
        }
    }
}

/// Usage statistics of an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub entries: usize,
    pub distinct_values: usize,
    pub lookups: u64,
    pub last_updated: DateTime<Utc>,
}

/// Filter applied to candidate keys by [`IndexQuery::take`].
pub type KeyFilter<'a> = &'a dyn Fn(&Key) -> bool;

/// Read access to an ordered index.
pub trait IndexQuery {
    fn id(&self) -> &str;

    fn name(&self) -> Option<&str>;

    /// The extractor expression.
    fn expression(&self) -> &Expr;

    fn compare_options(&self) -> CompareOptions;

    /// Whether the index answers `op`.
    fn supports(&self, op: Comparison) -> bool;

    /// Keys whose indexed value satisfies `op value`, in index order.
    fn lookup(&self, op: Comparison, value: &Value) -> BTreeSet<Key>;

    /// Keys whose indexed value lies within `query`, in index order.
    fn range_query(&self, query: &RangeQuery) -> Vec<Key>;

    /// Like [`IndexQuery::range_query`] but walking from `query.from` backwards.
    fn range_query_reversed(&self, query: &RangeQuery) -> Vec<Key>;

    /// Up to `n` keys strictly after `from` in index order that pass `filter`.
    fn take(&self, n: usize, from: Option<&Value>, filter: Option<KeyFilter<'_>>) -> Vec<Key>;

    /// Up to `n` keys strictly before `from` in reverse index order that pass `filter`.
    fn take_reversed(
        &self,
        n: usize,
        from: Option<&Value>,
        filter: Option<KeyFilter<'_>>,
    ) -> Vec<Key>;

    /// Number of indexed keys.
    fn key_count(&self) -> usize;

    /// Number of distinct indexed values.
    fn ordered_entries_count(&self) -> usize;

    /// The value indexed for `key`.
    fn indexed_value(&self, key: &Key) -> Option<Value>;

    fn stats(&self) -> IndexStats;

    /// Whether the index extracts exactly the field at `path`.
    fn matches_field(&self, path: &[String]) -> bool {
        self.expression().as_ref_path() == Some(path)
    }
}

/// An ordered B-tree index.
#[derive(Debug)]
pub struct BTreeIndex {
    id: String,
    name: Option<String>,
    expression: Expr,
    options: CompareOptions,
    ordered: BTreeMap<SortKey, BTreeSet<Key>>,
    values: HashMap<Key, Value>,
    lookups: AtomicU64,
    last_updated: DateTime<Utc>,
}

impl BTreeIndex {
    pub fn new(
        id: impl Into<String>,
        name: Option<String>,
        expression: Expr,
        options: CompareOptions,
    ) -> Self {
        Self {
            id: id.into(),
            name,
            expression,
            options,
            ordered: BTreeMap::new(),
            values: HashMap::new(),
            lookups: AtomicU64::new(0),
            last_updated: Utc::now(),
        }
    }

    fn sort_key(&self, value: Value) -> SortKey {
        SortKey::new(value, self.options)
    }

    /// Index an item.
    pub fn add(&mut self, key: &Key, item: &Value) {
        if self.values.contains_key(key) {
            self.remove(key);
        }
        let value = self.expression.evaluate(item);
        let sort_key = self.sort_key(value.clone());
        self.ordered.entry(sort_key).or_default().insert(key.clone());
        self.values.insert(key.clone(), value);
        self.last_updated = Utc::now();
    }

    /// Remove an item from the index.
    pub fn remove(&mut self, key: &Key) {
        let Some(value) = self.values.remove(key) else {
            return;
        };
        let sort_key = self.sort_key(value);
        if let Some(keys) = self.ordered.get_mut(&sort_key) {
            keys.remove(key);
            if keys.is_empty() {
                self.ordered.remove(&sort_key);
            }
        }
        self.last_updated = Utc::now();
    }

    /// Re-index an item whose value changed.
    pub fn update(&mut self, key: &Key, item: &Value) {
        self.remove(key);
        self.add(key, item);
    }

    /// Index every item, replacing current contents.
    pub fn build<'a>(&mut self, items: impl IntoIterator<Item = (&'a Key, &'a Value)>) {
        self.clear();
        for (key, item) in items {
            self.add(key, item);
        }
    }

    pub fn clear(&mut self) {
        self.ordered.clear();
        self.values.clear();
        self.last_updated = Utc::now();
    }

    fn count_lookup(&self) {
        self.lookups.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn collect<'a>(
        &self,
        buckets: impl Iterator<Item = (&'a SortKey, &'a BTreeSet<Key>)>,
    ) -> Vec<Key> {
        buckets.flat_map(|(_, keys)| keys.iter().cloned()).collect()
    }

    fn bounds(&self, query: &RangeQuery) -> Option<(Bound<SortKey>, Bound<SortKey>)> {
        let bound = |value: &Option<Value>, inclusive: bool| match value {
            None => Bound::Unbounded,
            Some(v) if inclusive => Bound::Included(self.sort_key(v.clone())),
            Some(v) => Bound::Excluded(self.sort_key(v.clone())),
        };
        if let (Some(from), Some(to)) = (&query.from, &query.to) {
            match self.sort_key(from.clone()).cmp(&self.sort_key(to.clone())) {
                Ordering::Greater => return None,
                Ordering::Equal if !(query.from_inclusive && query.to_inclusive) => return None,
                _ => {}
            }
        }
        Some((
            bound(&query.from, query.from_inclusive),
            bound(&query.to, query.to_inclusive),
        ))
    }
}

impl IndexQuery for BTreeIndex {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn expression(&self) -> &Expr {
        &self.expression
    }

    fn compare_options(&self) -> CompareOptions {
        self.options
    }

    fn supports(&self, _op: Comparison) -> bool {
        true
    }

    fn lookup(&self, op: Comparison, value: &Value) -> BTreeSet<Key> {
        self.count_lookup();
        let range = match op {
            Comparison::Eq => {
                return self
                    .ordered
                    .get(&self.sort_key(value.clone()))
                    .cloned()
                    .unwrap_or_default();
            }
            Comparison::In => {
                let candidates = match value {
                    Value::Array(values) => values.clone(),
                    other => vec![other.clone()],
                };
                return candidates
                    .into_iter()
                    .filter_map(|v| self.ordered.get(&self.sort_key(v)))
                    .flat_map(|keys| keys.iter().cloned())
                    .collect();
            }
            Comparison::Gt => RangeQuery::default().from(value.clone(), false),
            Comparison::Gte => RangeQuery::default().from(value.clone(), true),
            Comparison::Lt => RangeQuery::default().to(value.clone(), false),
            Comparison::Lte => RangeQuery::default().to(value.clone(), true),
        };
        self.range_query(&range).into_iter().collect()
    }

    fn range_query(&self, query: &RangeQuery) -> Vec<Key> {
        match self.bounds(query) {
            Some(bounds) => self.collect(self.ordered.range(bounds)),
            None => Vec::new(),
        }
    }

    fn range_query_reversed(&self, query: &RangeQuery) -> Vec<Key> {
        match self.bounds(&query.mirrored()) {
            Some(bounds) => self
                .ordered
                .range(bounds)
                .rev()
                .flat_map(|(_, keys)| keys.iter().rev().cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    fn take(&self, n: usize, from: Option<&Value>, filter: Option<KeyFilter<'_>>) -> Vec<Key> {
        let start = match from {
            Some(v) => Bound::Excluded(self.sort_key(v.clone())),
            None => Bound::Unbounded,
        };
        self.ordered
            .range((start, Bound::Unbounded))
            .flat_map(|(_, keys)| keys.iter())
            .filter(|key| filter.map_or(true, |f| f(key)))
            .take(n)
            .cloned()
            .collect()
    }

    fn take_reversed(
        &self,
        n: usize,
        from: Option<&Value>,
        filter: Option<KeyFilter<'_>>,
    ) -> Vec<Key> {
        let end = match from {
            Some(v) => Bound::Excluded(self.sort_key(v.clone())),
            None => Bound::Unbounded,
        };
        self.ordered
            .range((Bound::Unbounded, end))
            .rev()
            .flat_map(|(_, keys)| keys.iter().rev())
            .filter(|key| filter.map_or(true, |f| f(key)))
            .take(n)
            .cloned()
            .collect()
    }

    fn key_count(&self) -> usize {
        self.values.len()
    }

    fn ordered_entries_count(&self) -> usize {
        self.ordered.len()
    }

    fn indexed_value(&self, key: &Key) -> Option<Value> {
        self.values.get(key).cloned()
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            entries: self.values.len(),
            distinct_values: self.ordered.len(),
            lookups: self.lookups.load(AtomicOrdering::Relaxed),
            last_updated: self.last_updated,
        }
    }
}

/// A view of an index in the opposite order, sharing its storage.
pub struct ReverseIndex<'a> {
    base: &'a dyn IndexQuery,
}

impl<'a> ReverseIndex<'a> {
    pub fn new(base: &'a dyn IndexQuery) -> Self {
        Self { base }
    }
}

impl IndexQuery for ReverseIndex<'_> {
    fn id(&self) -> &str {
        self.base.id()
    }

    fn name(&self) -> Option<&str> {
        self.base.name()
    }

    fn expression(&self) -> &Expr {
        self.base.expression()
    }

    fn compare_options(&self) -> CompareOptions {
        let options = self.base.compare_options();
        options.with_direction(options.direction.flip())
    }

    fn supports(&self, op: Comparison) -> bool {
        self.base.supports(op)
    }

    fn lookup(&self, op: Comparison, value: &Value) -> BTreeSet<Key> {
        let mirrored = match op {
            Comparison::Gt => Comparison::Lt,
            Comparison::Gte => Comparison::Lte,
            Comparison::Lt => Comparison::Gt,
            Comparison::Lte => Comparison::Gte,
            other => other,
        };
        self.base.lookup(mirrored, value)
    }

    fn range_query(&self, query: &RangeQuery) -> Vec<Key> {
        self.base.range_query_reversed(query)
    }

    fn range_query_reversed(&self, query: &RangeQuery) -> Vec<Key> {
        self.base.range_query(query)
    }

    fn take(&self, n: usize, from: Option<&Value>, filter: Option<KeyFilter<'_>>) -> Vec<Key> {
        self.base.take_reversed(n, from, filter)
    }

    fn take_reversed(
        &self,
        n: usize,
        from: Option<&Value>,
        filter: Option<KeyFilter<'_>>,
    ) -> Vec<Key> {
        self.base.take(n, from, filter)
    }

    fn key_count(&self) -> usize {
        self.base.key_count()
    }

    fn ordered_entries_count(&self) -> usize {
        self.base.ordered_entries_count()
    }

    fn indexed_value(&self, key: &Key) -> Option<Value> {
        self.base.indexed_value(key)
    }

    fn stats(&self) -> IndexStats {
        self.base.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::field;
    use proptest::prelude::*;
    use serde_json::json;

    fn age_index(ages: &[(i64, i64)]) -> BTreeIndex {
        let mut index = BTreeIndex::new("idx", None, field("age"), CompareOptions::default());
        for (id, age) in ages {
            index.add(&Key::Int(*id), &json!({"id": id, "age": age}));
        }
        index
    }

    fn keys(ids: &[i64]) -> Vec<Key> {
        ids.iter().map(|i| Key::Int(*i)).collect()
    }

    #[test]
    fn lookup_operations() {
        let index = age_index(&[(1, 20), (2, 30), (3, 30), (4, 40)]);

        let eq: Vec<_> = index.lookup(Comparison::Eq, &json!(30)).into_iter().collect();
        assert_eq!(eq, keys(&[2, 3]));
        assert_eq!(index.lookup(Comparison::Gt, &json!(30)).len(), 1);
        assert_eq!(index.lookup(Comparison::Gte, &json!(30)).len(), 3);
        assert_eq!(index.lookup(Comparison::Lt, &json!(30)).len(), 1);
        assert_eq!(index.lookup(Comparison::Lte, &json!(30)).len(), 3);
        assert_eq!(index.lookup(Comparison::In, &json!([20, 40, 99])).len(), 2);
        assert_eq!(index.stats().lookups, 6);
    }

    #[test]
    fn range_queries() {
        let index = age_index(&[(1, 10), (2, 20), (3, 30), (4, 40)]);

        let q = RangeQuery::default()
            .from(json!(20), true)
            .to(json!(40), false);
        assert_eq!(index.range_query(&q), keys(&[2, 3]));
        assert_eq!(index.range_query_reversed(&q.mirrored()), keys(&[3, 2]));

        let empty = RangeQuery::default()
            .from(json!(30), false)
            .to(json!(30), true);
        assert!(index.range_query(&empty).is_empty());
        let inverted = RangeQuery::default().from(json!(40), true).to(json!(10), true);
        assert!(index.range_query(&inverted).is_empty());
    }

    #[test]
    fn take_walks_forward_from_value() {
        let index = age_index(&[(1, 10), (2, 20), (3, 30), (4, 40)]);

        assert_eq!(index.take(2, None, None), keys(&[1, 2]));
        assert_eq!(index.take(2, Some(&json!(20)), None), keys(&[3, 4]));

        let odd = |k: &Key| matches!(k, Key::Int(i) if i % 2 == 1);
        assert_eq!(index.take(5, None, Some(&odd)), keys(&[1, 3]));
        assert_eq!(index.take_reversed(2, Some(&json!(40)), None), keys(&[3, 2]));
    }

    #[test]
    fn update_and_remove() {
        let mut index = age_index(&[(1, 10), (2, 20)]);
        index.update(&Key::Int(1), &json!({"age": 25}));
        assert_eq!(index.take(10, None, None), keys(&[2, 1]));
        assert_eq!(index.indexed_value(&Key::Int(1)), Some(json!(25)));

        index.remove(&Key::Int(2));
        assert_eq!(index.key_count(), 1);
        assert_eq!(index.ordered_entries_count(), 1);
    }

    #[test]
    fn missing_fields_index_as_null() {
        let mut index = age_index(&[(1, 10)]);
        index.add(&Key::Int(2), &json!({"id": 2}));
        assert_eq!(index.take(1, None, None), keys(&[2]));
    }

    #[test]
    fn descending_index_orders_backwards() {
        let mut index = BTreeIndex::new("idx", None, field("age"), CompareOptions::descending());
        for (id, age) in [(1, 10), (2, 20), (3, 30)] {
            index.add(&Key::Int(id), &json!({"age": age}));
        }
        assert_eq!(index.take(3, None, None), keys(&[3, 2, 1]));
        assert_eq!(
            index.lookup(Comparison::Gt, &json!(20)).into_iter().collect::<Vec<_>>(),
            keys(&[1])
        );
    }

    #[test]
    fn reverse_view_flips_order() {
        let index = age_index(&[(1, 10), (2, 20), (3, 30)]);
        let reverse = ReverseIndex::new(&index);

        assert_eq!(reverse.take(3, None, None), keys(&[3, 2, 1]));
        assert_eq!(reverse.take(1, Some(&json!(30)), None), keys(&[2]));
        let q = RangeQuery::default().from(json!(30), true).to(json!(20), true);
        assert_eq!(reverse.range_query(&q), keys(&[3, 2]));
        assert_eq!(
            reverse.compare_options().direction,
            crate::compare::Direction::Desc
        );
    }

    proptest! {
        #[test]
        fn reverse_lookup_mirrors_base(ages in prop::collection::vec(0i64..50, 0..40), pivot in 0i64..50) {
            let pairs: Vec<_> = ages.iter().enumerate().map(|(i, a)| (i as i64, *a)).collect();
            let index = age_index(&pairs);
            let reverse = ReverseIndex::new(&index);
            let v = json!(pivot);

            prop_assert_eq!(reverse.lookup(Comparison::Gt, &v), index.lookup(Comparison::Lt, &v));
            prop_assert_eq!(reverse.lookup(Comparison::Gte, &v), index.lookup(Comparison::Lte, &v));
            prop_assert_eq!(reverse.lookup(Comparison::Lt, &v), index.lookup(Comparison::Gt, &v));
            prop_assert_eq!(reverse.lookup(Comparison::Lte, &v), index.lookup(Comparison::Gte, &v));
            prop_assert_eq!(reverse.take(7, Some(&v), None), index.take_reversed(7, Some(&v), None));
            prop_assert_eq!(reverse.take_reversed(7, Some(&v), None), index.take(7, Some(&v), None));
        }

        #[test]
        fn take_is_sorted_and_bounded(ages in prop::collection::vec(0i64..50, 0..40), n in 0usize..20) {
            let pairs: Vec<_> = ages.iter().enumerate().map(|(i, a)| (i as i64, *a)).collect();
            let index = age_index(&pairs);
            let taken = index.take(n, None, None);
            prop_assert_eq!(taken.len(), n.min(ages.len()));
            let values: Vec<i64> = taken
                .iter()
                .filter_map(|k| index.indexed_value(k).and_then(|v| v.as_i64()))
                .collect();
            prop_assert!(values.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
