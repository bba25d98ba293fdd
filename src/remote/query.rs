use std::cmp::Ordering;

use serde_json::Value;

use crate::remote::path::CollectionPath;
use crate::remote::snapshot::{lookup_field, DocumentSnapshot};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOperator {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    In,
    ArrayContains,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    field: String,
    operator: FilterOperator,
    value: Value,
}

impl FieldFilter {
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn operator(&self) -> FilterOperator {
        self.operator
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    fn matches(&self, snapshot: &DocumentSnapshot) -> bool {
        let Some(data) = snapshot.data() else {
            return false;
        };
        let Some(value) = lookup_field(data, &self.field) else {
            return self.operator == FilterOperator::NotEqual;
        };
        match self.operator {
            FilterOperator::Equal => compare_values(value, &self.value) == Some(Ordering::Equal),
            FilterOperator::NotEqual => compare_values(value, &self.value) != Some(Ordering::Equal),
            FilterOperator::LessThan => compare_values(value, &self.value) == Some(Ordering::Less),
            FilterOperator::LessThanOrEqual => matches!(
                compare_values(value, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOperator::GreaterThan => {
                compare_values(value, &self.value) == Some(Ordering::Greater)
            }
            FilterOperator::GreaterThanOrEqual => matches!(
                compare_values(value, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOperator::In => match &self.value {
                Value::Array(candidates) => candidates
                    .iter()
                    .any(|candidate| compare_values(value, candidate) == Some(Ordering::Equal)),
                _ => false,
            },
            FilterOperator::ArrayContains => match value {
                Value::Array(items) => items
                    .iter()
                    .any(|item| compare_values(item, &self.value) == Some(Ordering::Equal)),
                _ => false,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderDirection {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    field: String,
    direction: OrderDirection,
}

impl OrderBy {
    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn direction(&self) -> OrderDirection {
        self.direction
    }
}

/// Filtered, ordered and limited read over the direct children of one collection.
///
/// Documents that compare equal on every `order_by` clause fall back to document id order, so a
/// query result is always deterministic.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentQuery {
    collection: CollectionPath,
    filters: Vec<FieldFilter>,
    order_by: Vec<OrderBy>,
    limit: Option<usize>,
}

impl DocumentQuery {
    pub fn new(collection: CollectionPath) -> Self {
        Self {
            collection,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn where_field(
        mut self,
        field: impl Into<String>,
        operator: FilterOperator,
        value: impl Into<Value>,
    ) -> Self {
        self.filters
            .push(FieldFilter::new(field, operator, value.into()));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: OrderDirection) -> Self {
        self.order_by.push(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn collection(&self) -> &CollectionPath {
        &self.collection
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn ordering(&self) -> &[OrderBy] {
        &self.order_by
    }

    pub fn result_limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn matches(&self, snapshot: &DocumentSnapshot) -> bool {
        snapshot.exists()
            && snapshot.path().is_child_of(&self.collection)
            && self.filters.iter().all(|filter| filter.matches(snapshot))
    }

    /// Applies filters, ordering and limit to a set of candidate documents.
    pub fn apply(&self, documents: Vec<DocumentSnapshot>) -> Vec<DocumentSnapshot> {
        let mut matched: Vec<DocumentSnapshot> = documents
            .into_iter()
            .filter(|snapshot| self.matches(snapshot))
            .collect();
        matched.sort_by(|left, right| self.compare(left, right));
        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }

    fn compare(&self, left: &DocumentSnapshot, right: &DocumentSnapshot) -> Ordering {
        for order in &self.order_by {
            let left_value = left.get(&order.field).unwrap_or(&Value::Null);
            let right_value = right.get(&order.field).unwrap_or(&Value::Null);
            let mut ordering = compare_values(left_value, right_value)
                .unwrap_or_else(|| type_rank(left_value).cmp(&type_rank(right_value)));
            if order.direction == OrderDirection::Descending {
                ordering = ordering.reverse();
            }
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        left.id().cmp(right.id())
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Array(a), Value::Array(b)) => {
            for (left, right) in a.iter().zip(b.iter()) {
                match compare_values(left, right)? {
                    Ordering::Equal => continue,
                    other => return Some(other),
                }
            }
            Some(a.len().cmp(&b.len()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::path::DocumentPath;
    use serde_json::json;

    fn doc(path: &str, value: Value) -> DocumentSnapshot {
        DocumentSnapshot::new(
            DocumentPath::from_string(path).unwrap(),
            value.as_object().cloned(),
            None,
        )
    }

    #[test]
    fn orders_descending_with_id_tie_break() {
        let query = DocumentQuery::new(CollectionPath::from_string("leaderboards/global/entries").unwrap())
            .order_by("score", OrderDirection::Descending)
            .limit(2);
        let results = query.apply(vec![
            doc("leaderboards/global/entries/c", json!({"score": 300})),
            doc("leaderboards/global/entries/b", json!({"score": 500})),
            doc("leaderboards/global/entries/a", json!({"score": 500})),
            doc("leaderboards/daily/entries/z", json!({"score": 900})),
        ]);
        let ids: Vec<_> = results.iter().map(|snapshot| snapshot.id().to_string()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn filters_by_operator() {
        let collection = CollectionPath::from_string("tournaments").unwrap();
        let docs = vec![
            doc("tournaments/t1", json!({"endTime": "2026-05-02", "tags": ["spring"]})),
            doc("tournaments/t2", json!({"endTime": "2026-06-01", "tags": []})),
        ];
        let active = DocumentQuery::new(collection.clone())
            .where_field("endTime", FilterOperator::GreaterThan, "2026-05-10")
            .apply(docs.clone());
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id(), "t2");

        let tagged = DocumentQuery::new(collection)
            .where_field("tags", FilterOperator::ArrayContains, "spring")
            .apply(docs);
        assert_eq!(tagged[0].id(), "t1");
    }
}
