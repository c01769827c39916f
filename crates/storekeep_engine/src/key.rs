//! Record keys, key ranges and cursor directions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::ops::Bound;

/// A record key.
///
/// Keys are totally ordered: every integer sorts before every string, and
/// every string sorts before every byte key. Within a variant the natural
/// order applies.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    /// Integer key. Auto-increment keys are always integers.
    Int(i64),
    /// String key.
    Text(String),
    /// Binary key.
    Bytes(Vec<u8>),
}

impl Key {
    /// Converts a JSON value into a key.
    ///
    /// Integers and strings are valid keys. Everything else (floats with a
    /// fractional part, booleans, null, arrays, objects) is not.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Key::Int),
            Value::String(s) => Some(Key::Text(s.clone())),
            _ => None,
        }
    }

    /// Converts this key into a JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Key::Int(n) => Value::from(*n),
            Key::Text(s) => Value::from(s.as_str()),
            Key::Bytes(b) => Value::from(b.clone()),
        }
    }

    /// Returns the integer value if this is an integer key.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Key::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the string value if this is a string key.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Key::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(n) => write!(f, "{n}"),
            Key::Text(s) => write!(f, "{s:?}"),
            Key::Bytes(b) => write!(f, "bytes[{}]", b.len()),
        }
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Int(value)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Text(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Text(value)
    }
}

impl From<Vec<u8>> for Key {
    fn from(value: Vec<u8>) -> Self {
        Key::Bytes(value)
    }
}

/// Iteration direction for cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Ascending key order.
    #[default]
    Next,
    /// Descending key order.
    Prev,
}

/// A contiguous range of keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    /// Lower bound.
    pub lower: Bound<Key>,
    /// Upper bound.
    pub upper: Bound<Key>,
}

impl KeyRange {
    /// A range covering every key.
    #[must_use]
    pub fn all() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    /// A range containing exactly one key.
    pub fn only(key: impl Into<Key>) -> Self {
        let key = key.into();
        Self {
            lower: Bound::Included(key.clone()),
            upper: Bound::Included(key),
        }
    }

    /// A closed range `[lower, upper]`.
    pub fn bound(lower: impl Into<Key>, upper: impl Into<Key>) -> Self {
        Self {
            lower: Bound::Included(lower.into()),
            upper: Bound::Included(upper.into()),
        }
    }

    /// All keys greater than or equal to `lower`.
    pub fn lower_bound(lower: impl Into<Key>) -> Self {
        Self {
            lower: Bound::Included(lower.into()),
            upper: Bound::Unbounded,
        }
    }

    /// All keys less than or equal to `upper`.
    pub fn upper_bound(upper: impl Into<Key>) -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Included(upper.into()),
        }
    }

    /// String keys starting with `term`.
    ///
    /// This is the half-open range `[term, successor)`, where the successor
    /// is the smallest string above every continuation of `term`. Strings
    /// compare by code point, so no sentinel character bounds them all.
    #[must_use]
    pub fn prefix(term: &str) -> Self {
        let upper = match prefix_successor(term) {
            Some(next) => Key::Text(next),
            // No string bounds the prefix; stop below the first byte key.
            None => Key::Bytes(Vec::new()),
        };
        Self {
            lower: Bound::Included(Key::from(term)),
            upper: Bound::Excluded(upper),
        }
    }

    /// Returns true if `key` lies inside the range.
    #[must_use]
    pub fn contains(&self, key: &Key) -> bool {
        let above_lower = match &self.lower {
            Bound::Included(l) => key >= l,
            Bound::Excluded(l) => key > l,
            Bound::Unbounded => true,
        };
        let below_upper = match &self.upper {
            Bound::Included(u) => key <= u,
            Bound::Excluded(u) => key < u,
            Bound::Unbounded => true,
        };
        above_lower && below_upper
    }

    /// Returns true if no key can lie inside the range.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Bound::Included(l), Bound::Included(u)) => l > u,
            (Bound::Included(l), Bound::Excluded(u))
            | (Bound::Excluded(l), Bound::Included(u))
            | (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
            _ => false,
        }
    }

    /// Borrowed bounds, suitable for `BTreeMap::range`.
    ///
    /// Callers must check [`KeyRange::is_empty`] first.
    #[must_use]
    pub fn as_bounds(&self) -> (Bound<&Key>, Bound<&Key>) {
        (self.lower.as_ref(), self.upper.as_ref())
    }
}

/// The smallest string greater than every string starting with `term`, or
/// `None` if no string is.
fn prefix_successor(term: &str) -> Option<String> {
    let mut chars: Vec<char> = term.chars().collect();
    while let Some(last) = chars.pop() {
        let next = match last {
            char::MAX => continue,
            '\u{d7ff}' => '\u{e000}',
            c => char::from_u32(u32::from(c) + 1)?,
        };
        chars.push(next);
        return Some(chars.into_iter().collect());
    }
    None
}

impl Default for KeyRange {
    fn default() -> Self {
        Self::all()
    }
}
