use std::cmp::Ordering;

/// Value is a single scalar of a key row.
///
/// Values order by type rank first and payload second. `Min` and `Max` are
/// sentinels which sort below and above every other value; they never occur
/// in client data and are produced only when the planner synthesizes
/// breakpoints and prefix successors.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Value {
    Min,
    Null,
    Int64(i64),
    Uint64(u64),
    Double(f64),
    Boolean(bool),
    String(String),
    Max,
}

impl Value {
    fn type_rank(&self) -> u8 {
        match self {
            Value::Min => 0,
            Value::Null => 1,
            Value::Int64(_) => 2,
            Value::Uint64(_) => 3,
            Value::Double(_) => 4,
            Value::Boolean(_) => 5,
            Value::String(_) => 6,
            Value::Max => 7,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self, Value::Min | Value::Max)
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Int64(lhs), Value::Int64(rhs)) => lhs.cmp(rhs),
            (Value::Uint64(lhs), Value::Uint64(rhs)) => lhs.cmp(rhs),
            (Value::Double(lhs), Value::Double(rhs)) => lhs.total_cmp(rhs),
            (Value::Boolean(lhs), Value::Boolean(rhs)) => lhs.cmp(rhs),
            (Value::String(lhs), Value::String(rhs)) => lhs.cmp(rhs),
            (lhs, rhs) => lhs.type_rank().cmp(&rhs.type_rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}
impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint64(v)
    }
}
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key contains a {kind} sentinel at position {position}")]
    SentinelInKey { kind: &'static str, position: usize },
}

/// Key is an owned row of values used as a chunk or slice boundary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Key(Box<[Value]>);

impl Key {
    pub fn from_values(values: Vec<Value>) -> Self {
        Self(values.into())
    }

    /// Shorthand for integer keys, used pervasively in tests and examples.
    pub fn from_ints(values: &[i64]) -> Self {
        Self(values.iter().map(|v| Value::Int64(*v)).collect())
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Compare two keys over at most `prefix` leading columns.
    /// A key exhausted before the prefix sorts below a longer one.
    pub fn cmp_prefix(&self, other: &Key, prefix: usize) -> Ordering {
        let lhs = &self.0[..self.0.len().min(prefix)];
        let rhs = &other.0[..other.0.len().min(prefix)];

        for (l, r) in lhs.iter().zip(rhs.iter()) {
            match l.cmp(r) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        lhs.len().cmp(&rhs.len())
    }

    /// The first `prefix` columns as an owned key.
    pub fn prefix(&self, prefix: usize) -> Key {
        Self(self.0[..self.0.len().min(prefix)].to_vec().into())
    }

    /// The smallest key strictly greater than every key sharing this key's
    /// `prefix` leading columns: the prefix with a `Max` sentinel appended.
    pub fn prefix_successor(&self, prefix: usize) -> Key {
        let mut values: Vec<Value> = self.0[..self.0.len().min(prefix)].to_vec();
        values.push(Value::Max);
        Self(values.into())
    }

    /// Client keys must not carry sentinels; those exist only in keys the
    /// planner synthesizes itself.
    pub fn validate_client_key(&self) -> Result<(), KeyError> {
        for (position, value) in self.0.iter().enumerate() {
            if value.is_sentinel() {
                return Err(KeyError::SentinelInKey {
                    kind: match value {
                        Value::Min => "Min",
                        _ => "Max",
                    },
                    position,
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (index, value) in self.0.iter().enumerate() {
            if index != 0 {
                write!(f, ", ")?;
            }
            match value {
                Value::Min => write!(f, "<min>")?,
                Value::Null => write!(f, "null")?,
                Value::Int64(v) => write!(f, "{v}")?,
                Value::Uint64(v) => write!(f, "{v}u")?,
                Value::Double(v) => write!(f, "{v}")?,
                Value::Boolean(v) => write!(f, "{v}")?,
                Value::String(v) => write!(f, "{v:?}")?,
                Value::Max => write!(f, "<max>")?,
            }
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn value_ordering_ranks_types_then_payloads() {
        let mut values = vec![
            Value::Max,
            Value::String("a".to_string()),
            Value::Int64(10),
            Value::Null,
            Value::Int64(-3),
            Value::Min,
        ];
        values.sort();

        assert_eq!(
            values,
            vec![
                Value::Min,
                Value::Null,
                Value::Int64(-3),
                Value::Int64(10),
                Value::String("a".to_string()),
                Value::Max,
            ]
        );
    }

    #[test]
    fn prefix_comparison() {
        let a = Key::from_ints(&[1, 2, 3]);
        let b = Key::from_ints(&[1, 2, 9]);

        assert_eq!(a.cmp_prefix(&b, 2), Ordering::Equal);
        assert_eq!(a.cmp_prefix(&b, 3), Ordering::Less);

        // A shorter key sorts below a longer one sharing its columns.
        let short = Key::from_ints(&[1]);
        assert_eq!(short.cmp_prefix(&a, 3), Ordering::Less);
    }

    #[test]
    fn prefix_successor_brackets_the_key_group() {
        let key = Key::from_ints(&[5, 7]);
        let succ = key.prefix_successor(1);

        // Strictly above every key starting with 5, strictly below 6.
        assert_eq!(key.cmp_prefix(&succ, 2), Ordering::Less);
        assert_eq!(
            Key::from_ints(&[5, i64::MAX]).cmp_prefix(&succ, 2),
            Ordering::Less
        );
        assert_eq!(Key::from_ints(&[6]).cmp_prefix(&succ, 2), Ordering::Greater);
    }

    #[test]
    fn client_key_validation_rejects_sentinels() {
        assert!(Key::from_ints(&[1, 2]).validate_client_key().is_ok());

        let bad = Key::from_values(vec![Value::Int64(1), Value::Max]);
        let err = bad.validate_client_key().unwrap_err();
        assert_eq!(
            err.to_string(),
            "key contains a Max sentinel at position 1"
        );
    }
}
