use hyper::StatusCode;

/// WebDAV Depth
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Depth {
    Zero,
    One,
    Infinity,
}

impl Depth {
    pub fn as_str(self) -> &'static str {
        match self {
            Depth::Zero => "0",
            Depth::One => "1",
            Depth::Infinity => "infinity",
        }
    }
}

/// Traversal scope of a structured search.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SearchScope {
    /// Immediate children of the searched folder only.
    Shallow,
    /// The whole subtree.
    Deep,
}

impl SearchScope {
    pub fn as_sql(self) -> &'static str {
        match self {
            SearchScope::Shallow => "shallow traversal",
            SearchScope::Deep => "deep traversal",
        }
    }
}

/// Sort key for a structured search.
#[derive(Clone, Debug)]
pub struct OrderBy {
    pub prop: String,
    pub ascending: bool,
}

impl OrderBy {
    pub fn asc(prop: &str) -> Self {
        Self {
            prop: prop.to_string(),
            ascending: true,
        }
    }

    pub fn desc(prop: &str) -> Self {
        Self {
            prop: prop.to_string(),
            ascending: false,
        }
    }
}

/// Traversal direction of a progressive search. `Descending` starts from the
/// end of the result set, which is how "most recent N" views fill first.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SearchDirection {
    Ascending,
    Descending,
}

/// A typed property value as transmitted in a multistatus response.
///
/// Exactly one variant per property occurrence; the decoder never produces an
/// untyped container. Multi-valued variants preserve server order.
#[derive(Clone, Debug, PartialEq)]
pub enum PropValue {
    String(String),
    Int(i64),
    Bool(bool),
    Float(f64),
    /// Timestamp, kept as the server's ISO-8601 text.
    Date(String),
    Binary(Vec<u8>),
    StringArray(Vec<String>),
    IntArray(Vec<i64>),
    BinaryArray(Vec<Vec<u8>>),
    /// Opaque structured sub-document, preserved as raw XML for the caller
    /// to interpret.
    Xml(String),
}

impl PropValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::String(s) | PropValue::Date(s) | PropValue::Xml(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            PropValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            PropValue::Binary(b) => Some(b),
            _ => None,
        }
    }
}

/// Insertion-ordered mapping from fully-qualified property name to typed
/// value. Values are immutable once decoded; callers retaining one beyond the
/// owning result array clone it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PropertyBag {
    entries: Vec<(String, PropValue)>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, replacing any previous occurrence of the name in
    /// place so ordering stays stable.
    pub fn insert(&mut self, name: impl Into<String>, value: PropValue) {
        let name = name.into();
        if let Some(slot) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.entries.push((name, value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&PropValue> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn remove(&mut self, name: &str) -> Option<PropValue> {
        let idx = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, PropValue)> for PropertyBag {
    fn from_iter<I: IntoIterator<Item = (String, PropValue)>>(iter: I) -> Self {
        let mut bag = PropertyBag::new();
        for (name, value) in iter {
            bag.insert(name, value);
        }
        bag
    }
}

/// Per-resource outcome of a query or bulk operation. Bulk responses mix
/// successes and failures freely; callers test `status` per item.
#[derive(Clone, Debug)]
pub struct DavResult {
    pub href: String,
    pub status: StatusCode,
    /// Present whenever the item succeeded, even if no property came back;
    /// "bag present" is the success signal downstream code keys off.
    pub props: Option<PropertyBag>,
}

impl DavResult {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}
