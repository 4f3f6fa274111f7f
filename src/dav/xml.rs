//! Request-body builders for the extended-WebDAV verbs.
//!
//! Property names are fully qualified (`DAV:displayname`,
//! `urn:schemas:httpmail:subject`, `http://schemas.example.com/mapi/x`).
//! XML bodies declare one namespace prefix per distinct property namespace;
//! SQL search bodies quote the full name instead.

use crate::dav::types::{OrderBy, PropValue, PropertyBag, SearchScope};

pub const DT_NAMESPACE: &str = "urn:schemas-microsoft-com:datatypes";

pub fn escape_xml(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Split a fully-qualified property name into (namespace, localname). The
/// namespace keeps its trailing separator so it round-trips as an xmlns
/// value: `DAV:displayname` -> (`DAV:`, `displayname`),
/// `http://x.example/schema/prop` -> (`http://x.example/schema/`, `prop`).
pub fn split_prop(name: &str) -> (&str, &str) {
    match name.rfind(|c| c == '/' || c == ':') {
        Some(idx) => (&name[..=idx], &name[idx + 1..]),
        None => ("", name),
    }
}

/// Allocates one prefix per property namespace within a request body.
/// `DAV:` always maps to `D`; everything else gets `ns1`, `ns2`, ... in
/// first-seen order.
#[derive(Default)]
pub struct NamespaceMap {
    others: Vec<String>,
}

impl NamespaceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefix_for(&mut self, namespace: &str) -> String {
        if namespace == "DAV:" {
            return "D".to_string();
        }
        if let Some(idx) = self.others.iter().position(|ns| ns == namespace) {
            return format!("ns{}", idx + 1);
        }
        self.others.push(namespace.to_string());
        format!("ns{}", self.others.len())
    }

    /// The xmlns attributes for every namespace handed out so far, `DAV:`
    /// included.
    pub fn declarations(&self) -> String {
        let mut out = String::from(r#" xmlns:D="DAV:""#);
        for (idx, ns) in self.others.iter().enumerate() {
            out.push_str(&format!(r#" xmlns:ns{}="{}""#, idx + 1, escape_xml(ns)));
        }
        out
    }
}

fn prefixed_names<'a>(
    props: impl IntoIterator<Item = &'a str>,
    ns: &mut NamespaceMap,
) -> Vec<String> {
    props
        .into_iter()
        .map(|name| {
            let (namespace, local) = split_prop(name);
            format!("{}:{}", ns.prefix_for(namespace), local)
        })
        .collect()
}

fn push_targets(body: &mut String, targets: &[String]) {
    if targets.is_empty() {
        return;
    }
    body.push_str("<D:target>");
    for href in targets {
        body.push_str("<D:href>");
        body.push_str(&escape_xml(href));
        body.push_str("</D:href>");
    }
    body.push_str("</D:target>");
}

/// Build a `propfind` body requesting the given properties. A non-empty
/// target list turns it into the bulk form, addressed to the parent
/// collection instead of each resource.
pub fn build_propfind_body<'a>(
    props: impl IntoIterator<Item = &'a str>,
    targets: &[String],
) -> String {
    let mut ns = NamespaceMap::new();
    let names = prefixed_names(props, &mut ns);

    let mut body = format!("<D:propfind{}>", ns.declarations());
    push_targets(&mut body, targets);
    body.push_str("<D:prop>");
    for name in names {
        body.push('<');
        body.push_str(&name);
        body.push_str("/>");
    }
    body.push_str("</D:prop></D:propfind>");
    body
}

fn push_typed_value(body: &mut String, tag: &str, value: &PropValue) {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as B64;

    let (dt, text) = match value {
        PropValue::String(s) => (None, escape_xml(s)),
        PropValue::Int(i) => (Some("int"), i.to_string()),
        PropValue::Bool(b) => (Some("boolean"), if *b { "1" } else { "0" }.to_string()),
        PropValue::Float(f) => (Some("float"), f.to_string()),
        PropValue::Date(d) => (Some("dateTime.tz"), escape_xml(d)),
        PropValue::Binary(b) => (Some("bin.base64"), B64.encode(b)),
        PropValue::Xml(raw) => (None, raw.clone()),
        PropValue::StringArray(items) => {
            let mut inner = String::new();
            for item in items {
                inner.push_str("<li>");
                inner.push_str(&escape_xml(item));
                inner.push_str("</li>");
            }
            (Some("mv.string"), inner)
        }
        PropValue::IntArray(items) => {
            let mut inner = String::new();
            for item in items {
                inner.push_str("<li>");
                inner.push_str(&item.to_string());
                inner.push_str("</li>");
            }
            (Some("mv.int"), inner)
        }
        PropValue::BinaryArray(items) => {
            let mut inner = String::new();
            for item in items {
                inner.push_str("<li>");
                inner.push_str(&B64.encode(item));
                inner.push_str("</li>");
            }
            (Some("mv.bin.base64"), inner)
        }
    };

    body.push('<');
    body.push_str(tag);
    if let Some(dt) = dt {
        body.push_str(&format!(r#" dt:dt="{}""#, dt));
    }
    body.push('>');
    body.push_str(&text);
    body.push_str("</");
    body.push_str(tag);
    body.push('>');
}

/// Build a `propertyupdate` body with typed `set` values and a `remove`
/// list. Used by PROPPATCH/BPROPPATCH and as the optional MKCOL body; a
/// non-empty target list makes it the bulk form.
pub fn build_propertyupdate_body(
    set: &PropertyBag,
    remove: &[String],
    targets: &[String],
) -> String {
    let mut ns = NamespaceMap::new();
    let set_names = prefixed_names(set.iter().map(|(n, _)| n), &mut ns);
    let remove_names = prefixed_names(remove.iter().map(String::as_str), &mut ns);

    let mut body = format!(
        r#"<D:propertyupdate{} xmlns:dt="{}">"#,
        ns.declarations(),
        DT_NAMESPACE
    );
    push_targets(&mut body, targets);
    if !set.is_empty() {
        body.push_str("<D:set><D:prop>");
        for (tag, (_, value)) in set_names.iter().zip(set.iter()) {
            push_typed_value(&mut body, tag, value);
        }
        body.push_str("</D:prop></D:set>");
    }
    if !remove_names.is_empty() {
        body.push_str("<D:remove><D:prop>");
        for tag in &remove_names {
            body.push('<');
            body.push_str(tag);
            body.push_str("/>");
        }
        body.push_str("</D:prop></D:remove>");
    }
    body.push_str("</D:propertyupdate>");
    body
}

/// Build the target-list body shared by the bulk verbs (BDELETE, BMOVE,
/// BCOPY, BPROPFIND/BPROPPATCH on multiple resources). The root element
/// names the operation.
pub fn build_targets_body<'a>(root: &str, hrefs: impl IntoIterator<Item = &'a str>) -> String {
    let mut body = format!(r#"<D:{} xmlns:D="DAV:"><D:target>"#, root);
    for href in hrefs {
        body.push_str("<D:href>");
        body.push_str(&escape_xml(href));
        body.push_str("</D:href>");
    }
    body.push_str("</D:target></D:");
    body.push_str(root);
    body.push('>');
    body
}

fn quote_prop(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Build a `searchrequest` body around a compiled WHERE clause. An empty or
/// absent clause means "no restriction", never "match nothing".
pub fn build_search_body<'a>(
    scope_href: &str,
    scope: SearchScope,
    props: impl IntoIterator<Item = &'a str>,
    where_clause: Option<&str>,
    order_by: &[OrderBy],
) -> String {
    let mut sql = String::from("SELECT ");
    let mut first = true;
    for prop in props {
        if !first {
            sql.push_str(", ");
        }
        sql.push_str(&quote_prop(prop));
        first = false;
    }
    if first {
        // A SELECT list cannot be empty; href is always known to the server.
        sql.push_str(&quote_prop("DAV:href"));
    }

    sql.push_str(&format!(
        " FROM SCOPE('{} of \"{}\"')",
        scope.as_sql(),
        scope_href
    ));

    if let Some(clause) = where_clause.filter(|c| !c.is_empty()) {
        sql.push_str(" WHERE ");
        sql.push_str(clause);
    }

    if !order_by.is_empty() {
        sql.push_str(" ORDER BY ");
        for (idx, key) in order_by.iter().enumerate() {
            if idx > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&quote_prop(&key.prop));
            sql.push_str(if key.ascending { " ASC" } else { " DESC" });
        }
    }

    format!(
        r#"<D:searchrequest xmlns:D="DAV:"><D:sql>{}</D:sql></D:searchrequest>"#,
        escape_xml(&sql)
    )
}
