//! Protocol operation dispatch against one authenticated endpoint.
//!
//! A [`Connection`] owns the cross-cutting concerns every operation shares:
//! request construction, authentication (Basic header, challenge
//! classification, forms-based login), batching of the bulk verbs, range
//! paging of structured searches, the query cache, and the last server
//! timestamp. Redirects are surfaced to the caller instead of followed; the
//! hierarchy layer owns the decision whether its cached mapping is stale.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;
use chrono::{DateTime, FixedOffset};
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Uri, Version, header};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::cache::QueryCache;
use crate::common::compression::add_accept_encoding;
use crate::dav::auth::{
    AuthMode, CredentialStore, Credentials, classify_unauthorized, form_urlencode,
    parse_login_form, session_cookies,
};
use crate::dav::multistatus::parse_multistatus;
use crate::dav::transport::{HyperTransport, Transport};
use crate::dav::types::{DavResult, Depth, OrderBy, PropertyBag, SearchDirection, SearchScope};
use crate::dav::xml::{build_propertyupdate_body, build_propfind_body, build_search_body, build_targets_body};
use crate::error::{AuthFailure, Error, Result};
use crate::notify::NotifyState;
use crate::restriction::Restriction;

/// Forms-auth session timeout, sent by front ends instead of a 401.
const LOGIN_TIMEOUT: u16 = 440;

/// Rows requested per SEARCH sub-request.
const SEARCH_WINDOW: u64 = 100;

/// Batch size for the bulk verbs: one tenth of the workload so a failure
/// only spoils a slice, clamped so no request outgrows the server's
/// practical URL/body limits.
pub fn effective_batch_size(count: usize) -> usize {
    count.div_ceil(10).clamp(25, 100)
}

/// Decode a `Content-Range: rows a-b/total` header. The total is the
/// server's count for the whole result set, `*` when it does not know.
fn parse_rows_range(headers: &HeaderMap) -> Option<(u64, u64, Option<u64>)> {
    let value = headers.get(header::CONTENT_RANGE)?.to_str().ok()?;
    let rest = value.trim().strip_prefix("rows")?.trim();
    let (span, total) = rest.split_once('/')?;
    let (start, end) = span.trim().split_once('-')?;
    Some((
        start.trim().parse().ok()?,
        end.trim().parse().ok()?,
        total.trim().parse().ok(),
    ))
}

/// The `Range: rows=` forms a SEARCH can page with.
#[derive(Clone, Copy, Debug)]
enum RowsRange {
    /// `rows=start-(start+count-1)`.
    Forward { start: u64, count: u64 },
    /// `rows=-count`: the last `count` rows, anchoring a descending walk.
    Tail { count: u64 },
}

impl RowsRange {
    fn to_header(self) -> String {
        match self {
            RowsRange::Forward { start, count } => {
                format!("rows={}-{}", start, start + count.max(1) - 1)
            }
            RowsRange::Tail { count } => format!("rows=-{}", count.max(1)),
        }
    }
}

/// One decoded SEARCH page plus the range bookkeeping the pager needs.
struct SearchPage {
    results: Vec<DavResult>,
    /// First row index the server actually returned.
    first_row: Option<u64>,
    total: Option<u64>,
}

#[derive(Default)]
struct Session {
    /// Forms-auth session cookie, attached to every request once obtained.
    cookie: Option<String>,
    /// Most recent parsed `Date` response header; the notification layer
    /// uses it as a server-observed notion of "now".
    server_time: Option<DateTime<FixedOffset>>,
}

pub struct Connection<T: Transport = HyperTransport> {
    base: Uri,
    auth_mode: AuthMode,
    auth_header: Option<header::HeaderValue>,
    credentials: Option<Credentials>,
    credential_store: Option<Arc<dyn CredentialStore>>,
    pub(crate) transport: T,
    pub(crate) cache: QueryCache,
    session: Mutex<Session>,
    pub(crate) notify: NotifyState,
    pub(crate) shutdown: CancellationToken,
}

impl Connection<HyperTransport> {
    /// Create a connection to a **base URL** over the production transport.
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_transport(base_url, HyperTransport::new()?)
    }
}

impl<T: Transport> Connection<T> {
    pub fn with_transport(base_url: &str, transport: T) -> Result<Self> {
        Ok(Self {
            base: base_url.parse()?,
            auth_mode: AuthMode::Basic,
            auth_header: None,
            credentials: None,
            credential_store: None,
            transport,
            cache: QueryCache::new(),
            session: Mutex::new(Session::default()),
            notify: NotifyState::default(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_credentials(mut self, mode: AuthMode, username: &str, password: &str) -> Result<Self> {
        self.auth_mode = mode;
        self.credentials = Some(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        });
        self.auth_header = match mode {
            AuthMode::Basic => {
                let token = format!("{}:{}", username, password);
                let val = format!("Basic {}", B64.encode(token));
                Some(header::HeaderValue::from_str(&val)?)
            }
            // Challenge tokens belong to the host's security provider;
            // forms auth carries a cookie instead of a header.
            AuthMode::Challenge | AuthMode::Forms => None,
        };
        Ok(self)
    }

    /// Attach a host credential store, consulted when the forms-login flow
    /// needs a password the connection was not constructed with.
    pub fn with_credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credential_store = Some(store);
        self
    }

    pub fn auth_mode(&self) -> AuthMode {
        self.auth_mode
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// The most recent `Date` header any response carried, if one parsed.
    pub fn last_server_time(&self) -> Option<DateTime<FixedOffset>> {
        self.session.lock().ok().and_then(|s| s.server_time)
    }

    pub fn build_uri(&self, href: &str) -> Result<Uri> {
        resolve_relative(&self.base, href)
    }

    // ----------- Request plumbing -----------

    async fn send_raw(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: &Option<Bytes>,
        version: Option<Version>,
    ) -> Result<Response<Bytes>> {
        let mut req_builder = Request::builder().method(method.clone()).uri(uri.clone());
        if let Some(v) = version {
            req_builder = req_builder.version(v);
        }
        if let Some(auth) = &self.auth_header {
            req_builder = req_builder.header(header::AUTHORIZATION, auth);
        }
        if let Some(cookie) = self.session.lock().ok().and_then(|s| s.cookie.clone()) {
            req_builder = req_builder.header(header::COOKIE, header::HeaderValue::from_str(&cookie)?);
        }

        let mut headers = headers.clone();
        add_accept_encoding(&mut headers);
        if body.is_some() && !headers.contains_key(header::CONTENT_TYPE) {
            headers.insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("text/xml; charset=utf-8"),
            );
        }
        for (k, v) in headers.iter() {
            req_builder = req_builder.header(k, v);
        }

        let req = req_builder.body(body.clone().unwrap_or_default())?;
        let resp = self.transport.send(req).await?;
        self.observe_server_date(resp.headers());
        Ok(resp)
    }

    /// Send one request. A forms-auth session timeout (or a redirect to the
    /// logon page) re-runs the login flow once and retries exactly once; a
    /// second failure propagates.
    pub(crate) async fn send(
        &self,
        method: Method,
        href: &str,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<Response<Bytes>> {
        self.send_versioned(method, href, headers, body, None).await
    }

    async fn send_versioned(
        &self,
        method: Method,
        href: &str,
        headers: HeaderMap,
        body: Option<Bytes>,
        version: Option<Version>,
    ) -> Result<Response<Bytes>> {
        let uri = self.build_uri(href)?;
        let resp = self.send_raw(&method, &uri, &headers, &body, version).await?;
        if self.auth_mode == AuthMode::Forms && forms_login_required(&resp) {
            tracing::debug!(status = %resp.status(), "forms session rejected, re-running login");
            self.forms_login().await?;
            return self.send_raw(&method, &uri, &headers, &body, version).await;
        }
        Ok(resp)
    }

    fn observe_server_date(&self, headers: &HeaderMap) {
        let Some(date) = headers.get(header::DATE).and_then(|v| v.to_str().ok()) else {
            return;
        };
        if let Ok(parsed) = DateTime::parse_from_rfc2822(date)
            && let Ok(mut session) = self.session.lock()
        {
            session.server_time = Some(parsed);
        }
    }

    /// Map a non-success response to the error taxonomy: 3xx becomes a
    /// caller-visible redirect, 401 is classified against our auth mode,
    /// the rest stay status errors. 207 counts as success here; per-item
    /// failures stay in the decoded results.
    fn ensure_success(&self, resp: &Response<Bytes>) -> Result<()> {
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::Auth(classify_unauthorized(
                resp.headers(),
                self.auth_mode,
            )));
        }
        // A login timeout surviving the single forms-login retry means the
        // session could not be established; callers see an auth failure,
        // not an opaque status.
        if status.as_u16() == LOGIN_TIMEOUT {
            return Err(Error::Auth(AuthFailure::BadCredentials));
        }
        Err(Error::from_status(status, header_str(resp.headers(), header::LOCATION)))
    }

    // ----------- Forms-based authentication -----------

    fn forms_credentials(&self) -> Result<Credentials> {
        if let Some(creds) = &self.credentials {
            return Ok(creds.clone());
        }
        let key = self.credential_key();
        if let Some(store) = &self.credential_store
            && let Some(creds) = store.load(&key).or_else(|| store.prompt_and_save(&key))
        {
            return Ok(creds);
        }
        Err(Error::Auth(AuthFailure::BadCredentials))
    }

    fn credential_key(&self) -> String {
        self.base
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_default()
    }

    /// Simulate an interactive login: follow the auth redirect chain to the
    /// login page, scrape its form, POST the credentials to the discovered
    /// action address, and keep the session cookies.
    async fn forms_login(&self) -> Result<()> {
        let creds = self.forms_credentials()?;

        let mut page_uri = self.build_uri("")?;
        let mut page = None;
        for _ in 0..4 {
            let resp = self
                .send_raw(&Method::GET, &page_uri, &HeaderMap::new(), &None, None)
                .await?;
            if resp.status().is_redirection() {
                let Some(location) = header_str(resp.headers(), header::LOCATION) else {
                    break;
                };
                page_uri = resolve_relative(&page_uri, &location)?;
                continue;
            }
            page = Some(resp);
            break;
        }
        let page = page.ok_or(Error::Auth(AuthFailure::BadCredentials))?;

        let html = String::from_utf8_lossy(page.body());
        let form = parse_login_form(&html)
            .ok_or_else(|| Error::Decode("no login form on the authentication page".to_string()))?;

        let mut fields = form.hidden;
        fields.push((
            form.username_field.unwrap_or_else(|| "username".to_string()),
            creds.username.clone(),
        ));
        fields.push((
            form.password_field.unwrap_or_else(|| "password".to_string()),
            creds.password,
        ));

        let post_uri = resolve_relative(&page_uri, &form.action)?;
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        let body = Bytes::from(form_urlencode(&fields));
        let resp = self
            .send_raw(&Method::POST, &post_uri, &headers, &Some(body), None)
            .await?;

        match session_cookies(resp.headers()) {
            Some(cookie) => {
                tracing::debug!("forms login established a session");
                if let Ok(mut session) = self.session.lock() {
                    session.cookie = Some(cookie);
                }
                Ok(())
            }
            None => {
                if let Some(store) = &self.credential_store {
                    store.forget(&self.credential_key());
                }
                Err(Error::Auth(AuthFailure::BadCredentials))
            }
        }
    }

    // ----------- Single-resource operations -----------

    /// Retrieve raw resource content.
    pub async fn fetch(&self, href: &str) -> Result<Bytes> {
        let mut headers = HeaderMap::new();
        // Raw content, not the server's HTML rendition of it.
        headers.insert("Translate", header::HeaderValue::from_static("f"));
        let resp = self.send(Method::GET, href, headers, None).await?;
        self.ensure_success(&resp)?;
        Ok(resp.into_body())
    }

    /// Idempotent whole-resource replace. Forced to HTTP/1.0 so no
    /// `Expect: 100-continue` exchange happens; some front ends stall it.
    pub async fn store(&self, href: &str, content_type: &str, body: Bytes) -> Result<()> {
        self.cache.clear();
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, header::HeaderValue::from_str(content_type)?);
        let resp = self
            .send_versioned(Method::PUT, href, headers, Some(body), Some(Version::HTTP_10))
            .await?;
        self.ensure_success(&resp)
    }

    /// Store under a name unique within `folder`. On a name collision the
    /// name is rewritten with an incrementing numeric suffix and the store
    /// retried; there is no internal attempt limit, so callers that can
    /// pre-compute a unique name should prefer [`Connection::store`].
    /// Returns the address the content actually landed at.
    pub async fn append(
        &self,
        folder: &str,
        base_name: &str,
        content_type: &str,
        body: Bytes,
    ) -> Result<String> {
        self.cache.clear();
        let (stem, ext) = match base_name.rsplit_once('.') {
            Some((s, e)) => (s, Some(e)),
            None => (base_name, None),
        };
        let folder = folder.trim_end_matches('/');
        let mut suffix = 0u32;
        loop {
            let name = match (suffix, ext) {
                (0, _) => base_name.to_string(),
                (n, Some(ext)) => format!("{}-{}.{}", stem, n, ext),
                (n, None) => format!("{}-{}", stem, n),
            };
            let href = format!("{}/{}", folder, name);

            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, header::HeaderValue::from_str(content_type)?);
            headers.insert(header::IF_NONE_MATCH, header::HeaderValue::from_static("*"));
            let resp = self
                .send_versioned(
                    Method::PUT,
                    &href,
                    headers,
                    Some(body.clone()),
                    Some(Version::HTTP_10),
                )
                .await?;
            if resp.status() == StatusCode::PRECONDITION_FAILED {
                suffix += 1;
                tracing::trace!(href, "name taken, retrying with suffix {}", suffix);
                continue;
            }
            self.ensure_success(&resp)?;
            return Ok(href);
        }
    }

    pub async fn delete(&self, href: &str) -> Result<()> {
        self.cache.clear();
        let resp = self.send(Method::DELETE, href, HeaderMap::new(), None).await?;
        self.ensure_success(&resp)
    }

    /// Make a new folder-like resource, optionally setting properties
    /// atomically with creation.
    pub async fn create_collection(&self, href: &str, props: Option<&PropertyBag>) -> Result<()> {
        self.cache.clear();
        let body = props
            .filter(|p| !p.is_empty())
            .map(|p| Bytes::from(build_propertyupdate_body(p, &[], &[])));
        let resp = self
            .send(Method::from_bytes(b"MKCOL")?, href, HeaderMap::new(), body)
            .await?;
        self.ensure_success(&resp)
    }

    /// Single-resource property update. With `create` false an `If-Match`
    /// precondition confines the patch to an existing resource; otherwise
    /// the server creates one.
    pub async fn patch_properties(
        &self,
        href: &str,
        set: &PropertyBag,
        remove: &[String],
        create: bool,
    ) -> Result<Vec<DavResult>> {
        self.cache.clear();
        let body = Bytes::from(build_propertyupdate_body(set, remove, &[]));
        let mut headers = HeaderMap::new();
        if !create {
            headers.insert(header::IF_MATCH, header::HeaderValue::from_static("*"));
        }
        let resp = self
            .send(Method::from_bytes(b"PROPPATCH")?, href, headers, Some(body))
            .await?;
        self.ensure_success(&resp)?;
        parse_multistatus(resp.body())
    }

    /// Property fetch on one resource (or its children, per `depth`).
    pub async fn query(&self, href: &str, depth: Depth, props: &[String]) -> Result<Vec<DavResult>> {
        let body = Bytes::from(build_propfind_body(props.iter().map(String::as_str), &[]));
        let mut headers = HeaderMap::new();
        headers.insert("Depth", header::HeaderValue::from_static(depth.as_str()));
        headers.insert("Brief", header::HeaderValue::from_static("t"));
        let resp = self
            .send(Method::from_bytes(b"PROPFIND")?, href, headers, Some(body))
            .await?;
        self.ensure_success(&resp)?;
        parse_multistatus(resp.body())
    }

    // ----------- Bulk operations -----------
    //
    // Each partitions its targets with `effective_batch_size` and issues
    // the batches sequentially; per-item successes and failures stay mixed
    // in the returned results. Cancellation lands at batch boundaries only.

    pub async fn bulk_delete(&self, folder: &str, hrefs: &[String]) -> Result<Vec<DavResult>> {
        self.cache.clear();
        let size = effective_batch_size(hrefs.len());
        tracing::debug!(count = hrefs.len(), batch = size, "bulk delete");
        let mut results = Vec::with_capacity(hrefs.len());
        for batch in hrefs.chunks(size) {
            if self.shutdown.is_cancelled() {
                break;
            }
            let body = build_targets_body("delete", batch.iter().map(String::as_str));
            let resp = self
                .send(
                    Method::from_bytes(b"BDELETE")?,
                    folder,
                    HeaderMap::new(),
                    Some(Bytes::from(body)),
                )
                .await?;
            self.ensure_success(&resp)?;
            results.extend(parse_multistatus(resp.body())?);
        }
        Ok(results)
    }

    /// Bulk property fetch: one BPROPFIND per batch, addressed to the
    /// parent collection with a target list.
    pub async fn bulk_query(
        &self,
        folder: &str,
        hrefs: &[String],
        props: &[String],
    ) -> Result<Vec<DavResult>> {
        let size = effective_batch_size(hrefs.len());
        let mut results = Vec::with_capacity(hrefs.len());
        for batch in hrefs.chunks(size) {
            if self.shutdown.is_cancelled() {
                break;
            }
            let body = build_propfind_body(props.iter().map(String::as_str), batch);
            let mut headers = HeaderMap::new();
            headers.insert("Depth", header::HeaderValue::from_static("0"));
            headers.insert("Brief", header::HeaderValue::from_static("t"));
            let resp = self
                .send(
                    Method::from_bytes(b"BPROPFIND")?,
                    folder,
                    headers,
                    Some(Bytes::from(body)),
                )
                .await?;
            self.ensure_success(&resp)?;
            results.extend(parse_multistatus(resp.body())?);
        }
        Ok(results)
    }

    pub async fn bulk_patch_properties(
        &self,
        folder: &str,
        hrefs: &[String],
        set: &PropertyBag,
        remove: &[String],
        create: bool,
    ) -> Result<Vec<DavResult>> {
        self.cache.clear();
        let size = effective_batch_size(hrefs.len());
        let mut results = Vec::with_capacity(hrefs.len());
        for batch in hrefs.chunks(size) {
            if self.shutdown.is_cancelled() {
                break;
            }
            let body = build_propertyupdate_body(set, remove, batch);
            let mut headers = HeaderMap::new();
            if !create {
                headers.insert(header::IF_MATCH, header::HeaderValue::from_static("*"));
            }
            let resp = self
                .send(
                    Method::from_bytes(b"BPROPPATCH")?,
                    folder,
                    headers,
                    Some(Bytes::from(body)),
                )
                .await?;
            self.ensure_success(&resp)?;
            results.extend(parse_multistatus(resp.body())?);
        }
        Ok(results)
    }

    // ----------- Move / copy -----------

    /// Relocate one resource. `delete_original` selects MOVE over COPY.
    pub async fn transfer(
        &self,
        src: &str,
        dest: &str,
        delete_original: bool,
        overwrite: bool,
    ) -> Result<()> {
        self.transfer_inner(src, dest, delete_original, overwrite, None).await
    }

    /// Relocate a whole subtree.
    pub async fn transfer_directory(
        &self,
        src: &str,
        dest: &str,
        delete_original: bool,
        overwrite: bool,
    ) -> Result<()> {
        self.transfer_inner(src, dest, delete_original, overwrite, Some(Depth::Infinity))
            .await
    }

    async fn transfer_inner(
        &self,
        src: &str,
        dest: &str,
        delete_original: bool,
        overwrite: bool,
        depth: Option<Depth>,
    ) -> Result<()> {
        self.cache.clear();
        let method = Method::from_bytes(if delete_original { b"MOVE" } else { b"COPY" })?;
        let dest_uri = self.build_uri(dest)?;
        let mut headers = HeaderMap::new();
        headers.insert(
            "Destination",
            header::HeaderValue::from_str(&dest_uri.to_string())?,
        );
        headers.insert(
            "Overwrite",
            header::HeaderValue::from_static(if overwrite { "T" } else { "F" }),
        );
        if let Some(depth) = depth {
            headers.insert("Depth", header::HeaderValue::from_static(depth.as_str()));
        }
        let resp = self.send(method, src, headers, None).await?;
        self.ensure_success(&resp)
    }

    /// Bulk relocate of items out of `src_folder` into `dest_folder`. Each
    /// per-item result reports the address the item landed at (renames are
    /// allowed, so it may differ from the obvious one) under `DAV:location`.
    pub async fn bulk_transfer(
        &self,
        src_folder: &str,
        dest_folder: &str,
        hrefs: &[String],
        delete_originals: bool,
    ) -> Result<Vec<DavResult>> {
        self.cache.clear();
        let (method, root) = if delete_originals {
            (Method::from_bytes(b"BMOVE")?, "move")
        } else {
            (Method::from_bytes(b"BCOPY")?, "copy")
        };
        let dest_uri = self.build_uri(dest_folder)?;
        let size = effective_batch_size(hrefs.len());
        let mut results = Vec::with_capacity(hrefs.len());
        for batch in hrefs.chunks(size) {
            if self.shutdown.is_cancelled() {
                break;
            }
            let body = build_targets_body(root, batch.iter().map(String::as_str));
            let mut headers = HeaderMap::new();
            headers.insert(
                "Destination",
                header::HeaderValue::from_str(&dest_uri.to_string())?,
            );
            headers.insert("Overwrite", header::HeaderValue::from_static("F"));
            headers.insert("Allow-Rename", header::HeaderValue::from_static("t"));
            let resp = self
                .send(method.clone(), src_folder, headers, Some(Bytes::from(body)))
                .await?;
            self.ensure_success(&resp)?;
            results.extend(parse_multistatus(resp.body())?);
        }
        Ok(results)
    }

    // ----------- Structured search -----------

    fn search_sql(
        &self,
        folder: &str,
        scope: SearchScope,
        props: &[String],
        restriction: Option<&Restriction>,
        order_by: &[OrderBy],
        folders_only: bool,
    ) -> String {
        let mut clause = restriction.and_then(Restriction::compile);
        if folders_only {
            let folders = r#""DAV:isfolder" = True"#.to_string();
            clause = Some(match clause {
                Some(c) => format!("({} AND {})", c, folders),
                None => folders,
            });
        }
        build_search_body(
            folder,
            scope,
            props.iter().map(String::as_str),
            clause.as_deref(),
            order_by,
        )
    }

    async fn search_window(&self, folder: &str, body: &str, range: RowsRange) -> Result<SearchPage> {
        let mut headers = HeaderMap::new();
        headers.insert("Range", header::HeaderValue::from_str(&range.to_header())?);
        headers.insert("Brief", header::HeaderValue::from_static("t"));
        let resp = self
            .send(
                Method::from_bytes(b"SEARCH")?,
                folder,
                headers,
                Some(Bytes::copy_from_slice(body.as_bytes())),
            )
            .await?;
        // Asking past the end of the result set is a normal pager outcome.
        if resp.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(SearchPage {
                results: Vec::new(),
                first_row: None,
                total: Some(0),
            });
        }
        self.ensure_success(&resp)?;
        let (first_row, total) = match parse_rows_range(resp.headers()) {
            Some((start, _, total)) => (Some(start), total),
            None => (None, None),
        };
        Ok(SearchPage {
            results: parse_multistatus(resp.body())?,
            first_row,
            total,
        })
    }

    async fn search_all(&self, folder: &str, body: &str) -> Result<Vec<DavResult>> {
        let mut results = Vec::new();
        let mut start = 0u64;
        let mut total = None;
        loop {
            let page = self
                .search_window(folder, body, RowsRange::Forward { start, count: SEARCH_WINDOW })
                .await?;
            let got = page.results.len() as u64;
            if page.total.is_some() {
                total = page.total;
            }
            results.extend(page.results);
            start += got;
            if got == 0 {
                break;
            }
            match total {
                Some(t) if start < t => continue,
                Some(_) => break,
                // No Content-Range: a short page is the only end signal.
                None if got == SEARCH_WINDOW => continue,
                None => break,
            }
        }
        tracing::debug!(folder, rows = results.len(), "search complete");
        Ok(results)
    }

    /// Structured query, accumulating every range-limited sub-request into
    /// one result array.
    pub async fn search(
        &self,
        folder: &str,
        scope: SearchScope,
        props: &[String],
        restriction: Option<&Restriction>,
        order_by: &[OrderBy],
        folders_only: bool,
    ) -> Result<Vec<DavResult>> {
        let body = self.search_sql(folder, scope, props, restriction, order_by, folders_only);
        self.search_all(folder, &body).await
    }

    /// [`Connection::search`] through the query cache. The cache key is the
    /// literal request text, so textually different but equivalent trees
    /// miss on purpose.
    pub async fn search_cached(
        &self,
        folder: &str,
        scope: SearchScope,
        props: &[String],
        restriction: Option<&Restriction>,
        order_by: &[OrderBy],
        folders_only: bool,
    ) -> Result<Vec<DavResult>> {
        let body = self.search_sql(folder, scope, props, restriction, order_by, folders_only);
        self.cache
            .search_or_fetch(&body, || self.search_all(folder, &body))
            .await
    }

    /// Structured query that hands each page to `progress` as it arrives so
    /// a caller can paint incremental UI. The callback's return value sizes
    /// the next window (clamped to 100); returning 0 ends the search after
    /// the current page. `Descending` starts from the end of the result
    /// set and walks backwards, which is how "most recent N" views fill
    /// first.
    pub async fn search_with_progress<F>(
        &self,
        folder: &str,
        scope: SearchScope,
        props: &[String],
        restriction: Option<&Restriction>,
        order_by: &[OrderBy],
        direction: SearchDirection,
        mut progress: F,
    ) -> Result<Vec<DavResult>>
    where
        F: FnMut(&[DavResult]) -> usize,
    {
        let body = self.search_sql(folder, scope, props, restriction, order_by, false);
        let mut results = Vec::new();
        let mut window = SEARCH_WINDOW;

        match direction {
            SearchDirection::Ascending => {
                let mut start = 0u64;
                let mut total = None;
                loop {
                    let page = self
                        .search_window(folder, &body, RowsRange::Forward { start, count: window })
                        .await?;
                    let got = page.results.len() as u64;
                    if page.total.is_some() {
                        total = page.total;
                    }
                    let next = progress(&page.results);
                    results.extend(page.results);
                    start += got;
                    if next == 0 || got == 0 {
                        break;
                    }
                    if let Some(t) = total
                        && start >= t
                    {
                        break;
                    }
                    if total.is_none() && got < window {
                        break;
                    }
                    window = (next as u64).min(SEARCH_WINDOW);
                }
            }
            SearchDirection::Descending => {
                let page = self
                    .search_window(folder, &body, RowsRange::Tail { count: window })
                    .await?;
                let mut lower = page.first_row.unwrap_or(0);
                let next = progress(&page.results);
                results.extend(page.results);
                if next == 0 || lower == 0 {
                    return Ok(results);
                }
                window = (next as u64).min(SEARCH_WINDOW);
                loop {
                    let count = window.min(lower);
                    let start = lower - count;
                    let page = self
                        .search_window(folder, &body, RowsRange::Forward { start, count })
                        .await?;
                    let next = progress(&page.results);
                    results.extend(page.results);
                    lower = start;
                    if next == 0 || lower == 0 {
                        break;
                    }
                    window = (next as u64).min(SEARCH_WINDOW);
                }
            }
        }
        Ok(results)
    }
}

fn forms_login_required(resp: &Response<Bytes>) -> bool {
    let status = resp.status();
    if status.as_u16() == LOGIN_TIMEOUT {
        return true;
    }
    status.is_redirection()
        && header_str(resp.headers(), header::LOCATION)
            .map(|l| l.to_ascii_lowercase().contains("logon"))
            .unwrap_or(false)
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Resolve an address against a base: absolute URLs pass through, rooted
/// and relative paths graft onto the base's scheme and authority.
fn resolve_relative(base: &Uri, href: &str) -> Result<Uri> {
    if href.starts_with("http://") || href.starts_with("https://") {
        return Ok(href.parse()?);
    }

    let mut parts = base.clone().into_parts();
    let existing_path = parts
        .path_and_query
        .as_ref()
        .map(|pq| pq.path())
        .unwrap_or("/");

    let (path_only, query) = match href.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (href, None),
    };

    let mut combined = if path_only.is_empty() {
        existing_path.to_string()
    } else if path_only.starts_with('/') {
        path_only.to_string()
    } else {
        let mut base_path = existing_path.trim_end_matches('/').to_string();
        base_path.push('/');
        base_path.push_str(path_only);
        base_path
    };
    if combined.is_empty() {
        combined.push('/');
    }

    parts.path_and_query = Some(match query {
        Some(q) => format!("{}?{}", combined, q).parse()?,
        None => combined.parse()?,
    });
    Ok(Uri::from_parts(parts)?)
}
