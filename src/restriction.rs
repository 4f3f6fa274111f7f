//! Structured query filters and their compilation to the server's
//! SQL-flavoured WHERE syntax.
//!
//! A [`Restriction`] is an immutable expression tree; cloning bumps a
//! reference count, never copies the tree. Compilation is a partial
//! function: comparators or node kinds the query language cannot express
//! compile to "no constraint", and a boolean combinator whose children all
//! vanish vanishes with them. The empty outcome means "no restriction",
//! never "match nothing".

use std::sync::Arc;

use crate::dav::types::PropValue;

/// Relational operator of a property comparison. Only the six SQL-expressible
/// operators survive compilation; the rest exist for callers that feed the
/// tree to other backends and compile to no constraint here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Relop {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    /// Regex match. Not expressible in the query language.
    Regex,
}

impl Relop {
    fn as_sql(self) -> Option<&'static str> {
        match self {
            Relop::Lt => Some("<"),
            Relop::Le => Some("<="),
            Relop::Gt => Some(">"),
            Relop::Ge => Some(">="),
            Relop::Eq => Some("="),
            Relop::Ne => Some("!="),
            Relop::Regex => None,
        }
    }
}

/// The 2-bit fuzziness selector of a content-match node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fuzzy {
    Full,
    Substring,
    Prefix,
    Suffix,
}

/// Bitmask test polarity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitmaskTest {
    EqualsZero,
    NotEqualsZero,
}

#[derive(Debug)]
enum Node {
    And(Vec<Restriction>),
    Or(Vec<Restriction>),
    Not(Restriction),
    Cmp {
        prop: String,
        op: Relop,
        value: PropValue,
    },
    CmpProps {
        left: String,
        op: Relop,
        right: String,
    },
    Content {
        prop: String,
        fuzzy: Fuzzy,
        text: String,
    },
    Bitmask {
        prop: String,
        test: BitmaskTest,
        mask: u32,
    },
    Size {
        prop: String,
        op: Relop,
        size: u32,
    },
    Exists(String),
    /// Annotation carried for the builder's benefit; never compiled.
    Comment(String),
    /// Reserved sub-query variant; never compiled.
    Sub(Restriction),
}

/// A shared, immutable query expression tree node.
#[derive(Clone, Debug)]
pub struct Restriction(Arc<Node>);

impl Restriction {
    pub fn and(children: Vec<Restriction>) -> Self {
        Restriction(Arc::new(Node::And(children)))
    }

    pub fn or(children: Vec<Restriction>) -> Self {
        Restriction(Arc::new(Node::Or(children)))
    }

    pub fn not(child: Restriction) -> Self {
        Restriction(Arc::new(Node::Not(child)))
    }

    /// Compare a property against a typed literal.
    pub fn cmp(prop: &str, op: Relop, value: PropValue) -> Self {
        Restriction(Arc::new(Node::Cmp {
            prop: prop.to_string(),
            op,
            value,
        }))
    }

    /// Compare two properties of the same resource.
    pub fn cmp_props(left: &str, op: Relop, right: &str) -> Self {
        Restriction(Arc::new(Node::CmpProps {
            left: left.to_string(),
            op,
            right: right.to_string(),
        }))
    }

    /// Text content match with a fuzziness selector.
    pub fn content(prop: &str, fuzzy: Fuzzy, text: &str) -> Self {
        Restriction(Arc::new(Node::Content {
            prop: prop.to_string(),
            fuzzy,
            text: text.to_string(),
        }))
    }

    pub fn bitmask(prop: &str, test: BitmaskTest, mask: u32) -> Self {
        Restriction(Arc::new(Node::Bitmask {
            prop: prop.to_string(),
            test,
            mask,
        }))
    }

    pub fn size(prop: &str, op: Relop, size: u32) -> Self {
        Restriction(Arc::new(Node::Size {
            prop: prop.to_string(),
            op,
            size,
        }))
    }

    pub fn exists(prop: &str) -> Self {
        Restriction(Arc::new(Node::Exists(prop.to_string())))
    }

    pub fn comment(text: &str) -> Self {
        Restriction(Arc::new(Node::Comment(text.to_string())))
    }

    pub fn sub(inner: Restriction) -> Self {
        Restriction(Arc::new(Node::Sub(inner)))
    }

    // Convenience leaf builders for the common typed comparisons.

    pub fn prop_string(prop: &str, op: Relop, value: &str) -> Self {
        Self::cmp(prop, op, PropValue::String(value.to_string()))
    }

    pub fn prop_bool(prop: &str, op: Relop, value: bool) -> Self {
        Self::cmp(prop, op, PropValue::Bool(value))
    }

    pub fn prop_int(prop: &str, op: Relop, value: i64) -> Self {
        Self::cmp(prop, op, PropValue::Int(value))
    }

    pub fn prop_date(prop: &str, op: Relop, value: &str) -> Self {
        Self::cmp(prop, op, PropValue::Date(value.to_string()))
    }

    /// Compile the tree to WHERE-clause text. `None` means the whole tree
    /// expressed no constraint; callers must not turn that into a
    /// match-nothing clause.
    pub fn compile(&self) -> Option<String> {
        compile_node(&self.0).filter(|s| !s.is_empty())
    }
}

fn quote_prop(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quote a string/date literal, doubling embedded quotes.
fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn literal(value: &PropValue) -> Option<String> {
    match value {
        PropValue::String(s) => Some(quote_literal(s)),
        PropValue::Date(d) => Some(quote_literal(d)),
        PropValue::Int(i) => Some(i.to_string()),
        PropValue::Bool(b) => Some(if *b { "True" } else { "False" }.to_string()),
        PropValue::Float(f) => Some(f.to_string()),
        // Binary, arrays and structured documents have no literal syntax.
        _ => None,
    }
}

fn compile_boolean(children: &[Restriction], sep: &str) -> Option<String> {
    let mut parts: Vec<String> = children
        .iter()
        .filter_map(|child| compile_node(&child.0))
        .collect();
    match parts.len() {
        // Every child vanished: the combinator is dropped rather than
        // emitting an empty, invalid clause.
        0 => None,
        1 => parts.pop(),
        _ => Some(format!("({})", parts.join(sep))),
    }
}

fn compile_node(node: &Node) -> Option<String> {
    match node {
        Node::And(children) => compile_boolean(children, " AND "),
        Node::Or(children) => compile_boolean(children, " OR "),
        Node::Not(child) => compile_node(&child.0).map(|c| format!("NOT ({})", c)),
        Node::Cmp { prop, op, value } => {
            let op = op.as_sql()?;
            let lit = literal(value)?;
            Some(format!("{} {} {}", quote_prop(prop), op, lit))
        }
        Node::CmpProps { left, op, right } => {
            let op = op.as_sql()?;
            Some(format!(
                "{} {} {}",
                quote_prop(left),
                op,
                quote_prop(right)
            ))
        }
        Node::Content { prop, fuzzy, text } => {
            let prop = quote_prop(prop);
            Some(match fuzzy {
                Fuzzy::Full => format!("{} = {}", prop, quote_literal(text)),
                Fuzzy::Prefix => {
                    format!("{} LIKE {}", prop, quote_literal(&format!("{}%", text)))
                }
                Fuzzy::Suffix => {
                    format!("{} LIKE {}", prop, quote_literal(&format!("%{}", text)))
                }
                Fuzzy::Substring => {
                    format!("{} LIKE {}", prop, quote_literal(&format!("%{}%", text)))
                }
            })
        }
        Node::Bitmask { prop, test, mask } => {
            let rel = match test {
                BitmaskTest::EqualsZero => "=",
                BitmaskTest::NotEqualsZero => "!=",
            };
            Some(format!("({} & {}) {} 0", quote_prop(prop), mask, rel))
        }
        Node::Size { prop, op, size } => {
            let op = op.as_sql()?;
            Some(format!("{} {} {}", quote_prop(prop), op, size))
        }
        Node::Exists(prop) => Some(format!("{} IS NOT NULL", quote_prop(prop))),
        // Reserved node kinds compile to no constraint.
        Node::Comment(_) | Node::Sub(_) => None,
    }
}
