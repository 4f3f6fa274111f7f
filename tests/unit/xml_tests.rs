use exdav::dav::xml::{
    build_propertyupdate_body, build_propfind_body, build_search_body, build_targets_body,
    split_prop,
};
use exdav::{OrderBy, PropValue, PropertyBag, SearchScope};

#[test]
fn split_prop_keeps_the_separator_on_the_namespace() {
    assert_eq!(split_prop("DAV:displayname"), ("DAV:", "displayname"));
    assert_eq!(
        split_prop("urn:schemas:httpmail:subject"),
        ("urn:schemas:httpmail:", "subject")
    );
    assert_eq!(
        split_prop("http://schemas.example.com/mapi/x"),
        ("http://schemas.example.com/mapi/", "x")
    );
    assert_eq!(split_prop("bare"), ("", "bare"));
}

#[test]
fn propfind_body_allocates_one_prefix_per_namespace() {
    let body = build_propfind_body(
        [
            "DAV:displayname",
            "urn:schemas:httpmail:subject",
            "urn:schemas:httpmail:date",
        ],
        &[],
    );
    assert!(body.contains(r#"xmlns:D="DAV:""#));
    assert!(body.contains(r#"xmlns:ns1="urn:schemas:httpmail:""#));
    assert!(!body.contains("xmlns:ns2"), "same namespace reuses ns1: {body}");
    assert!(body.contains("<D:displayname/>"));
    assert!(body.contains("<ns1:subject/>"));
    assert!(body.contains("<ns1:date/>"));
}

#[test]
fn propfind_body_with_targets_is_the_bulk_form() {
    let targets = vec!["a.eml".to_string(), "b.eml".to_string()];
    let body = build_propfind_body(["DAV:getetag"], &targets);
    assert!(body.contains("<D:target><D:href>a.eml</D:href><D:href>b.eml</D:href></D:target>"));
}

#[test]
fn propertyupdate_body_types_its_values() {
    let mut set = PropertyBag::new();
    set.insert("urn:schemas:httpmail:read", PropValue::Bool(true));
    set.insert("urn:schemas:mailheader:importance", PropValue::Int(2));
    set.insert("DAV:comment", PropValue::String("a < b".to_string()));
    let remove = vec!["urn:schemas:httpmail:textdescription".to_string()];

    let body = build_propertyupdate_body(&set, &remove, &[]);
    assert!(body.contains(r#"xmlns:dt="urn:schemas-microsoft-com:datatypes""#));
    assert!(body.contains(r#"<ns1:read dt:dt="boolean">1</ns1:read>"#));
    assert!(body.contains(r#"<ns2:importance dt:dt="int">2</ns2:importance>"#));
    assert!(body.contains("<D:comment>a &lt; b</D:comment>"));
    // The remove list shares the namespace prefix the set list allocated.
    assert!(body.contains("<D:remove><D:prop><ns1:textdescription/></D:prop></D:remove>"));
}

#[test]
fn propertyupdate_body_encodes_multi_valued_and_binary() {
    let mut set = PropertyBag::new();
    set.insert(
        "urn:schemas:calendar:categories",
        PropValue::StringArray(vec!["work".to_string(), "travel".to_string()]),
    );
    set.insert("urn:schemas:mapi:blob", PropValue::Binary(vec![0xde, 0xad]));

    let body = build_propertyupdate_body(&set, &[], &[]);
    assert!(body.contains(r#"dt:dt="mv.string"><li>work</li><li>travel</li>"#));
    assert!(body.contains(r#"dt:dt="bin.base64">3q0="#));
}

#[test]
fn targets_body_names_the_operation() {
    let body = build_targets_body("delete", ["x.eml", "y.eml"]);
    assert_eq!(
        body,
        r#"<D:delete xmlns:D="DAV:"><D:target><D:href>x.eml</D:href><D:href>y.eml</D:href></D:target></D:delete>"#
    );
}

#[test]
fn search_body_wraps_escaped_sql() {
    let body = build_search_body(
        "/ex/Inbox/",
        SearchScope::Shallow,
        ["DAV:displayname"],
        Some(r#""DAV:ishidden" = False"#),
        &[OrderBy::desc("urn:schemas:httpmail:date")],
    );
    assert!(body.starts_with(r#"<D:searchrequest xmlns:D="DAV:"><D:sql>"#));
    // SQL is text content: its quotes arrive escaped.
    assert!(body.contains(
        "SELECT &quot;DAV:displayname&quot; FROM SCOPE(&apos;shallow traversal of &quot;/ex/Inbox/&quot;&apos;)"
    ));
    assert!(body.contains("WHERE &quot;DAV:ishidden&quot; = False"));
    assert!(body.contains("ORDER BY &quot;urn:schemas:httpmail:date&quot; DESC"));
}

#[test]
fn search_body_with_no_props_or_clause_stays_minimal() {
    let body = build_search_body("/ex/", SearchScope::Deep, [], None, &[]);
    assert!(body.contains("SELECT &quot;DAV:href&quot; FROM SCOPE(&apos;deep traversal"));
    assert!(!body.contains("WHERE"));
    assert!(!body.contains("ORDER BY"));
}
