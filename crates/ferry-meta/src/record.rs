//! The [`Record`] trait and the storage-side query language.

use std::cmp::Ordering;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A payload persisted by an [`ItemStore`](crate::ItemStore).
///
/// Encoding uses serde + postcard. `id`/`set_id` tie the payload to its
/// storage key, and `field` exposes named values to [`Filter`] and [`Order`].
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Fields maintained in the secondary index. Eq filters on these are
    /// answered from the index instead of a full scan.
    const INDEXED: &'static [&'static str];

    /// Storage key of this record.
    fn id(&self) -> &str;

    /// Overwrite the storage key carried inside the payload.
    fn set_id(&mut self, id: &str);

    /// Value of a named field, or `None` if the record has no such field.
    fn field(&self, name: &str) -> Option<FieldValue>;
}

/// A comparable field value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FieldValue {
    /// Signed integer (timestamps, enum discriminants, byte counts).
    Int(i64),
    /// UTF-8 string.
    Str(String),
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        Self::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl FieldValue {
    /// Order-preserving byte encoding used in index keys.
    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::Int(v) => {
                out.push(b'i');
                // Flip the sign bit so negative numbers sort first.
                out.extend_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes());
            }
            Self::Str(s) => {
                out.push(b's');
                out.extend_from_slice(&(s.len() as u32).to_be_bytes());
                out.extend_from_slice(s.as_bytes());
            }
        }
    }
}

/// Storage-side filter over [`Record::field`] values.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Filter {
    /// Matches every record.
    #[default]
    All,
    /// Field equals value.
    Eq(&'static str, FieldValue),
    /// Field is less than or equal to value.
    Lte(&'static str, FieldValue),
    /// Field is greater than or equal to value.
    Gte(&'static str, FieldValue),
    /// Every sub-filter matches.
    And(Vec<Filter>),
    /// At least one sub-filter matches.
    Or(Vec<Filter>),
}

impl Filter {
    /// Shorthand for [`Filter::Eq`].
    pub fn eq(field: &'static str, value: impl Into<FieldValue>) -> Self {
        Self::Eq(field, value.into())
    }

    /// Shorthand for [`Filter::Lte`].
    pub fn lte(field: &'static str, value: impl Into<FieldValue>) -> Self {
        Self::Lte(field, value.into())
    }

    /// Shorthand for [`Filter::Gte`].
    pub fn gte(field: &'static str, value: impl Into<FieldValue>) -> Self {
        Self::Gte(field, value.into())
    }

    /// Conjunction of `self` and `other`, flattening nested `And`s.
    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Self::All, f) | (f, Self::All) => f,
            (Self::And(mut a), Self::And(b)) => {
                a.extend(b);
                Self::And(a)
            }
            (Self::And(mut a), f) => {
                a.push(f);
                Self::And(a)
            }
            (f, Self::And(mut b)) => {
                b.insert(0, f);
                Self::And(b)
            }
            (a, b) => Self::And(vec![a, b]),
        }
    }

    /// Evaluate the filter against a record.
    pub fn matches<R: Record>(&self, record: &R) -> bool {
        let cmp = |field: &str, value: &FieldValue| record.field(field).map(|v| v.cmp(value));
        match self {
            Self::All => true,
            Self::Eq(f, v) => cmp(f, v) == Some(Ordering::Equal),
            Self::Lte(f, v) => matches!(cmp(f, v), Some(Ordering::Less | Ordering::Equal)),
            Self::Gte(f, v) => matches!(cmp(f, v), Some(Ordering::Greater | Ordering::Equal)),
            Self::And(all) => all.iter().all(|f| f.matches(record)),
            Self::Or(any) => any.iter().any(|f| f.matches(record)),
        }
    }

    /// An Eq clause on an indexed field that every match must satisfy.
    pub(crate) fn index_hint(&self, indexed: &[&str]) -> Option<(&'static str, &FieldValue)> {
        match self {
            Self::Eq(f, v) if indexed.contains(f) => Some((*f, v)),
            Self::And(all) => all.iter().find_map(|f| f.index_hint(indexed)),
            _ => None,
        }
    }
}

/// Sort order for query results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    /// Field to sort by.
    pub field: &'static str,
    /// Largest first when set.
    pub descending: bool,
}

impl Order {
    /// Ascending by `field`.
    pub fn asc(field: &'static str) -> Self {
        Self {
            field,
            descending: false,
        }
    }

    /// Descending by `field`.
    pub fn desc(field: &'static str) -> Self {
        Self {
            field,
            descending: true,
        }
    }

    /// Compare two records; ties are broken by id for a stable order.
    pub fn compare<R: Record>(&self, a: &R, b: &R) -> Ordering {
        let by_field = a.field(self.field).cmp(&b.field(self.field));
        let by_field = if self.descending {
            by_field.reverse()
        } else {
            by_field
        };
        by_field.then_with(|| a.id().cmp(b.id()))
    }
}

/// Filter plus optional order, as evaluated by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreQuery {
    /// Storage-side filter.
    pub filter: Filter,
    /// Result order; unordered queries return records in key order.
    pub order: Option<Order>,
}

impl StoreQuery {
    /// Query with the given filter and no particular order.
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            order: None,
        }
    }

    /// Set the result order.
    pub fn order_by(mut self, order: Order) -> Self {
        self.order = Some(order);
        self
    }
}
