use bytes::Bytes;
use hyper::{Response, StatusCode, Version};

use exdav::dav::effective_batch_size;
use exdav::{
    AuthFailure, AuthMode, Depth, Error, PropValue, PropertyBag, Relop, Restriction,
    SearchDirection, SearchScope,
};

use crate::helpers::{
    EMPTY_MULTISTATUS, MockTransport, connection, multistatus_response, status_response,
    two_item_multistatus,
};

#[test]
fn batch_size_is_a_tenth_clamped() {
    assert_eq!(effective_batch_size(1), 25);
    assert_eq!(effective_batch_size(100), 25);
    assert_eq!(effective_batch_size(250), 25);
    assert_eq!(effective_batch_size(300), 30);
    assert_eq!(effective_batch_size(999), 100);
    assert_eq!(effective_batch_size(10_000), 100);
}

#[tokio::test]
async fn bulk_delete_issues_ceil_n_over_batch_requests() {
    let transport = MockTransport::new();
    let (_, log) = transport.handles();
    // 300 items -> batch size 30 -> 10 requests.
    for _ in 0..10 {
        transport.push(multistatus_response(EMPTY_MULTISTATUS, None));
    }
    let conn = connection(transport);

    let hrefs: Vec<String> = (0..300).map(|i| format!("m{}.eml", i)).collect();
    conn.bulk_delete("Inbox/", &hrefs).await.unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 10);
    assert!(log.iter().all(|r| r.method.as_str() == "BDELETE"));
    let first = log[0].body_str();
    assert!(first.contains("<D:delete"));
    assert!(first.contains("<D:href>m0.eml</D:href>"));
    assert!(first.contains("<D:href>m29.eml</D:href>"));
    assert!(!first.contains("<D:href>m30.eml</D:href>"));
}

#[tokio::test]
async fn search_scenario_compiles_and_decodes() {
    let transport = MockTransport::new();
    let (_, log) = transport.handles();
    transport.push(multistatus_response(
        &two_item_multistatus(),
        Some("rows 0-1/2"),
    ));
    let conn = connection(transport);

    let filter = Restriction::and(vec![
        Restriction::prop_bool("IsCollection", Relop::Eq, false),
        Restriction::prop_string("ContentClass", Relop::Eq, "appt"),
    ]);
    let results = conn
        .search(
            "Calendar/",
            SearchScope::Shallow,
            &["DAV:displayname".to_string()],
            Some(&filter),
            &[],
            false,
        )
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(
        results[0].props.as_ref().unwrap().get("DAV:displayname"),
        Some(&PropValue::String("first".to_string()))
    );

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 1);
    let sent = &log[0];
    assert_eq!(sent.method.as_str(), "SEARCH");
    assert_eq!(sent.header("Range"), Some("rows=0-99"));
    let body = sent.body_str();
    assert!(body.contains(
        "(&quot;IsCollection&quot; = False AND &quot;ContentClass&quot; = &apos;appt&apos;)"
    ));
}

#[tokio::test]
async fn search_pages_until_the_reported_total() {
    let transport = MockTransport::new();
    let (_, log) = transport.handles();
    transport.push(multistatus_response(
        &two_item_multistatus(),
        Some("rows 0-1/4"),
    ));
    transport.push(multistatus_response(
        &two_item_multistatus(),
        Some("rows 2-3/4"),
    ));
    let conn = connection(transport);

    let results = conn
        .search("Inbox/", SearchScope::Shallow, &[], None, &[], false)
        .await
        .unwrap();
    assert_eq!(results.len(), 4);
    assert_eq!(log.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn progressive_search_stops_after_one_request_on_zero() {
    let transport = MockTransport::new();
    let (_, log) = transport.handles();
    transport.push(multistatus_response(
        &two_item_multistatus(),
        Some("rows 0-1/1000"),
    ));
    let conn = connection(transport);

    let results = conn
        .search_with_progress(
            "Inbox/",
            SearchScope::Shallow,
            &[],
            None,
            &[],
            SearchDirection::Ascending,
            |_page| 0,
        )
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn descending_search_starts_from_the_tail() {
    let transport = MockTransport::new();
    let (_, log) = transport.handles();
    transport.push(multistatus_response(
        &two_item_multistatus(),
        Some("rows 8-9/10"),
    ));
    transport.push(multistatus_response(
        &two_item_multistatus(),
        Some("rows 6-7/10"),
    ));
    let conn = connection(transport);

    conn.search_with_progress(
        "Inbox/",
        SearchScope::Shallow,
        &[],
        None,
        &[],
        SearchDirection::Descending,
        {
            let mut calls = 0;
            move |_page| {
                calls += 1;
                if calls >= 2 { 0 } else { 2 }
            }
        },
    )
    .await
    .unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].header("Range"), Some("rows=-100"));
    assert_eq!(log[1].header("Range"), Some("rows=6-7"));
}

#[tokio::test]
async fn cached_search_fetches_once_until_a_write() {
    let transport = MockTransport::new();
    let (queue, log) = transport.handles();
    transport.push(multistatus_response(
        &two_item_multistatus(),
        Some("rows 0-1/2"),
    ));
    let conn = connection(transport);

    let props = vec!["DAV:displayname".to_string()];
    for _ in 0..2 {
        let results = conn
            .search_cached("Inbox/", SearchScope::Shallow, &props, None, &[], false)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
    }
    assert_eq!(log.lock().unwrap().len(), 1);

    // Any write clears the cache, so the next search goes to the server.
    queue
        .lock()
        .unwrap()
        .push_back(status_response(204));
    queue.lock().unwrap().push_back(multistatus_response(
        &two_item_multistatus(),
        Some("rows 0-1/2"),
    ));
    conn.delete("Inbox/m1.eml").await.unwrap();
    conn.search_cached("Inbox/", SearchScope::Shallow, &props, None, &[], false)
        .await
        .unwrap();
    assert_eq!(log.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn store_forces_http_10() {
    let transport = MockTransport::new();
    let (_, log) = transport.handles();
    transport.push(status_response(201));
    let conn = connection(transport);

    conn.store("Inbox/new.eml", "message/rfc822", Bytes::from_static(b"body"))
        .await
        .unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log[0].version, Version::HTTP_10);
    assert_eq!(log[0].header("Content-Type"), Some("message/rfc822"));
}

#[tokio::test]
async fn append_renames_on_collision() {
    let transport = MockTransport::new();
    let (_, log) = transport.handles();
    transport.push(status_response(412));
    transport.push(status_response(412));
    transport.push(status_response(201));
    let conn = connection(transport);

    let href = conn
        .append("Drafts/", "note.eml", "message/rfc822", Bytes::from_static(b"x"))
        .await
        .unwrap();

    assert_eq!(href, "Drafts/note-2.eml");
    let log = log.lock().unwrap();
    assert_eq!(log.len(), 3);
    assert!(log.iter().all(|r| r.header("If-None-Match") == Some("*")));
}

#[tokio::test]
async fn fetch_requests_raw_content() {
    let transport = MockTransport::new();
    let (_, log) = transport.handles();
    transport.push(
        Response::builder()
            .status(StatusCode::OK)
            .body(Bytes::from_static(b"raw bytes"))
            .unwrap(),
    );
    let conn = connection(transport);

    let body = conn.fetch("Inbox/m1.eml").await.unwrap();
    assert_eq!(&body[..], b"raw bytes");
    assert_eq!(log.lock().unwrap()[0].header("Translate"), Some("f"));
}

#[tokio::test]
async fn redirects_surface_instead_of_being_followed() {
    let transport = MockTransport::new();
    transport.push(
        Response::builder()
            .status(StatusCode::MOVED_PERMANENTLY)
            .header("Location", "http://127.0.0.1/elsewhere/")
            .body(Bytes::new())
            .unwrap(),
    );
    let conn = connection(transport);

    match conn.fetch("Inbox/m1.eml").await {
        Err(Error::Redirected { location }) => {
            assert_eq!(location.as_deref(), Some("http://127.0.0.1/elsewhere/"));
        }
        other => panic!("expected redirect error, got {:?}", other),
    }
}

#[tokio::test]
async fn wrong_auth_mode_is_classified() {
    let transport = MockTransport::new();
    transport.push(
        Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header("WWW-Authenticate", "NTLM")
            .body(Bytes::new())
            .unwrap(),
    );
    let conn = connection(transport)
        .with_credentials(AuthMode::Basic, "user", "secret")
        .unwrap();

    match conn.fetch("Inbox/m1.eml").await {
        Err(Error::Auth(AuthFailure::WrongMode)) => {}
        other => panic!("expected wrong-mode auth error, got {:?}", other),
    }
}

#[tokio::test]
async fn query_sends_depth_and_brief() {
    let transport = MockTransport::new();
    let (_, log) = transport.handles();
    transport.push(multistatus_response(&two_item_multistatus(), None));
    let conn = connection(transport);

    conn.query("Inbox/", Depth::One, &["DAV:displayname".to_string()])
        .await
        .unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log[0].method.as_str(), "PROPFIND");
    assert_eq!(log[0].header("Depth"), Some("1"));
    assert_eq!(log[0].header("Brief"), Some("t"));
    assert!(log[0].body_str().contains("<D:displayname/>"));
}

#[tokio::test]
async fn transfer_sets_destination_and_overwrite() {
    let transport = MockTransport::new();
    let (_, log) = transport.handles();
    transport.push(status_response(201));
    let conn = connection(transport);

    conn.transfer("Inbox/m1.eml", "Archive/m1.eml", true, false)
        .await
        .unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log[0].method.as_str(), "MOVE");
    assert_eq!(
        log[0].header("Destination"),
        Some("http://127.0.0.1/ex/Archive/m1.eml")
    );
    assert_eq!(log[0].header("Overwrite"), Some("F"));
}

#[tokio::test]
async fn bulk_transfer_allows_renames() {
    let transport = MockTransport::new();
    let (_, log) = transport.handles();
    transport.push(multistatus_response(
        r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/ex/Inbox/a.eml</D:href>
    <D:status>HTTP/1.1 201 Created</D:status>
    <D:location><D:href>/ex/Archive/a-2.eml</D:href></D:location>
  </D:response>
</D:multistatus>"#,
        None,
    ));
    let conn = connection(transport);

    let results = conn
        .bulk_transfer("Inbox/", "Archive/", &["a.eml".to_string()], true)
        .await
        .unwrap();

    assert_eq!(
        results[0].props.as_ref().unwrap().get("DAV:location"),
        Some(&PropValue::String("/ex/Archive/a-2.eml".to_string()))
    );
    let log = log.lock().unwrap();
    assert_eq!(log[0].method.as_str(), "BMOVE");
    assert_eq!(log[0].header("Allow-Rename"), Some("t"));
    assert!(log[0].body_str().contains("<D:move"));
}

#[tokio::test]
async fn patch_properties_guards_existing_resources() {
    let transport = MockTransport::new();
    let (_, log) = transport.handles();
    transport.push(multistatus_response(&two_item_multistatus(), None));
    let conn = connection(transport);

    let mut set = PropertyBag::new();
    set.insert("urn:schemas:httpmail:read", PropValue::Bool(true));
    conn.patch_properties("Inbox/m1.eml", &set, &[], false)
        .await
        .unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log[0].method.as_str(), "PROPPATCH");
    assert_eq!(log[0].header("If-Match"), Some("*"));
    assert!(log[0].body_str().contains(r#"dt:dt="boolean">1"#));
}

#[tokio::test]
async fn forms_session_is_reestablished_once() {
    let transport = MockTransport::new();
    let (_, log) = transport.handles();
    // Original request bounces with the forms-auth timeout status.
    transport.push(status_response(440));
    // Login page fetch.
    transport.push(
        Response::builder()
            .status(StatusCode::OK)
            .body(Bytes::from_static(
                br#"<html><form action="/auth/owaauth.dll" method="post">
<input type="hidden" name="destination" value="/ex/">
<input type="text" name="username">
<input type="password" name="password">
</form></html>"#,
            ))
            .unwrap(),
    );
    // Credential POST answers with the session cookie.
    transport.push(
        Response::builder()
            .status(StatusCode::FOUND)
            .header("Set-Cookie", "sessionid=abc123; path=/")
            .body(Bytes::new())
            .unwrap(),
    );
    // Retried original request.
    transport.push(
        Response::builder()
            .status(StatusCode::OK)
            .body(Bytes::from_static(b"content"))
            .unwrap(),
    );
    let conn = connection(transport)
        .with_credentials(AuthMode::Forms, "user", "secret")
        .unwrap();

    let body = conn.fetch("Inbox/m1.eml").await.unwrap();
    assert_eq!(&body[..], b"content");

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 4);
    assert_eq!(log[1].method.as_str(), "GET");
    let post = &log[2];
    assert_eq!(post.method.as_str(), "POST");
    assert!(post.uri.path().ends_with("/auth/owaauth.dll"));
    let form = post.body_str();
    assert!(form.contains("destination=%2Fex%2F"));
    assert!(form.contains("username=user"));
    assert!(form.contains("password=secret"));
    // The retry carries the freshly minted session cookie.
    assert_eq!(log[3].header("Cookie"), Some("sessionid=abc123"));
}

#[tokio::test]
async fn second_forms_rejection_is_an_auth_error() {
    let transport = MockTransport::new();
    let (_, log) = transport.handles();
    transport.push(status_response(440));
    transport.push(
        Response::builder()
            .status(StatusCode::OK)
            .body(Bytes::from_static(
                br#"<html><form action="/auth/owaauth.dll" method="post">
<input type="text" name="username">
<input type="password" name="password">
</form></html>"#,
            ))
            .unwrap(),
    );
    transport.push(
        Response::builder()
            .status(StatusCode::FOUND)
            .header("Set-Cookie", "sessionid=abc123; path=/")
            .body(Bytes::new())
            .unwrap(),
    );
    // The retried request bounces again; a second login is not attempted
    // and the caller sees an authentication failure, not a bare status.
    transport.push(status_response(440));
    let conn = connection(transport)
        .with_credentials(AuthMode::Forms, "user", "secret")
        .unwrap();

    match conn.fetch("Inbox/m1.eml").await {
        Err(Error::Auth(AuthFailure::BadCredentials)) => {}
        other => panic!("expected auth error, got {:?}", other),
    }
    assert_eq!(log.lock().unwrap().len(), 4);
}
