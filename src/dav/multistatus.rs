//! Multistatus response decoding.
//!
//! Turns a `207 Multi-Status` body into typed [`DavResult`]s. Each
//! per-resource block needs an href to be kept; a missing status means the
//! server's brief mode assumed success; the `dt` attribute on a property
//! element selects its typed decoding, and typeless nested content is kept
//! as an opaque XML fragment.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use hyper::StatusCode;
use quick_xml::NsReader;
use quick_xml::escape::unescape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;

use crate::dav::types::{DavResult, PropValue, PropertyBag};
use crate::error::{Error, Result};

/// Parse an `HTTP/1.1 207 Multi-Status`-style status line into its code.
pub fn parse_status_line(line: &str) -> Option<StatusCode> {
    let code: u16 = line.split_whitespace().nth(1)?.parse().ok()?;
    StatusCode::from_u16(code).ok()
}

/// True when every per-item status in the array is a success. The query
/// cache only stores fully-successful outcomes.
pub fn all_successful(results: &[DavResult]) -> bool {
    results.iter().all(DavResult::is_success)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElementName {
    Multistatus,
    Response,
    Propstat,
    Prop,
    Href,
    Status,
    Location,
    Other,
}

fn element_from_local(local: &[u8]) -> ElementName {
    if local.eq_ignore_ascii_case(b"multistatus") {
        ElementName::Multistatus
    } else if local.eq_ignore_ascii_case(b"response") {
        ElementName::Response
    } else if local.eq_ignore_ascii_case(b"propstat") {
        ElementName::Propstat
    } else if local.eq_ignore_ascii_case(b"prop") {
        ElementName::Prop
    } else if local.eq_ignore_ascii_case(b"href") {
        ElementName::Href
    } else if local.eq_ignore_ascii_case(b"status") {
        ElementName::Status
    } else if local.eq_ignore_ascii_case(b"location") {
        ElementName::Location
    } else {
        ElementName::Other
    }
}

/// In-flight capture of one property element below `<prop>`.
struct PropCapture {
    name: String,
    dt: Option<String>,
    text: String,
    /// One entry per child element for multi-valued types, server order.
    values: Vec<String>,
    /// Raw reserialized children for the untyped-structured case.
    raw: String,
    /// Prefixed names of open nested elements, for closing tags.
    open: Vec<String>,
}

impl PropCapture {
    fn new(name: String, dt: Option<String>) -> Self {
        Self {
            name,
            dt,
            text: String::new(),
            values: Vec::new(),
            raw: String::new(),
            open: Vec::new(),
        }
    }

    fn multi_valued(&self) -> bool {
        matches!(self.dt.as_deref(), Some(d) if d.starts_with("mv."))
    }

    fn has_children(&self) -> bool {
        !self.raw.is_empty() || !self.values.is_empty()
    }

    fn finish(self) -> (String, PropValue) {
        let text = self.text.trim();
        let value = match self.dt.as_deref() {
            Some("int") | Some("i2") | Some("i4") | Some("i8") => text
                .parse::<i64>()
                .map(PropValue::Int)
                .unwrap_or_else(|_| PropValue::String(text.to_string())),
            Some("boolean") => PropValue::Bool(matches!(text, "1" | "true" | "True")),
            Some("float") | Some("r4") | Some("r8") | Some("number") => text
                .parse::<f64>()
                .map(PropValue::Float)
                .unwrap_or_else(|_| PropValue::String(text.to_string())),
            Some(dt) if dt.starts_with("dateTime") => PropValue::Date(text.to_string()),
            Some("bin.base64") => PropValue::Binary(decode_b64(text)),
            Some("mv.string") => PropValue::StringArray(self.values),
            Some("mv.int") => PropValue::IntArray(
                self.values
                    .iter()
                    .map(|v| v.trim().parse::<i64>().unwrap_or(0))
                    .collect(),
            ),
            // Undecodable entries become zero-length blobs instead of being
            // dropped, keeping positional alignment with sibling
            // multi-valued properties.
            Some("mv.bin.base64") => {
                PropValue::BinaryArray(self.values.iter().map(|v| decode_b64(v)).collect())
            }
            Some(_) => PropValue::String(text.to_string()),
            None if self.has_children() => PropValue::Xml(self.raw),
            None => PropValue::String(text.to_string()),
        };
        (self.name, value)
    }
}

fn decode_b64(text: &str) -> Vec<u8> {
    let cleaned: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    B64.decode(cleaned).unwrap_or_default()
}

struct ResponseBlock {
    href: Option<String>,
    status: Option<StatusCode>,
    propstat_status: Option<StatusCode>,
    bag: PropertyBag,
    /// Properties and status of the propstat currently open; committed on
    /// `</propstat>` only when its status was absent or successful.
    pending: PropertyBag,
    pending_status: Option<StatusCode>,
}

impl ResponseBlock {
    fn new() -> Self {
        Self {
            href: None,
            status: None,
            propstat_status: None,
            bag: PropertyBag::new(),
            pending: PropertyBag::new(),
            pending_status: None,
        }
    }

    fn close_propstat(&mut self) {
        let status = self.pending_status.take();
        let ok = status.map(|s| s.is_success()).unwrap_or(true);
        if ok {
            for (name, value) in std::mem::take(&mut self.pending).iter() {
                self.bag.insert(name.to_string(), value.clone());
            }
        } else {
            self.pending = PropertyBag::new();
        }
        // Prefer a successful propstat status for the item when mixed.
        match (self.propstat_status, status) {
            (None, Some(s)) => self.propstat_status = Some(s),
            (Some(prev), Some(s)) if !prev.is_success() && s.is_success() => {
                self.propstat_status = Some(s);
            }
            _ => {}
        }
    }

    fn finish(self) -> Option<DavResult> {
        // A block without a resource address is malformed and discarded.
        let href = self.href.filter(|h| !h.is_empty())?;
        let status = self
            .status
            .or(self.propstat_status)
            .unwrap_or(StatusCode::OK);
        let props = status.is_success().then_some(self.bag);
        Some(DavResult {
            href,
            status,
            props,
        })
    }
}

struct MultistatusParser {
    stack: Vec<ElementName>,
    current: Option<ResponseBlock>,
    capture: Option<PropCapture>,
    results: Vec<DavResult>,
}

impl MultistatusParser {
    fn new() -> Self {
        Self {
            stack: Vec::with_capacity(8),
            current: None,
            capture: None,
            results: Vec::new(),
        }
    }

    fn in_prop(&self) -> bool {
        self.stack.len() >= 2
            && self.stack[self.stack.len() - 1] == ElementName::Prop
            && self.stack[self.stack.len() - 2] == ElementName::Propstat
    }

    fn on_start(&mut self, fqname: String, event: &BytesStart<'_>, self_closing: bool) {
        if let Some(capture) = self.capture.as_mut() {
            // Nested element inside a property.
            if capture.multi_valued() && capture.open.is_empty() {
                capture.values.push(String::new());
            }
            let raw_name = String::from_utf8_lossy(event.name().as_ref()).into_owned();
            capture.raw.push('<');
            capture.raw.push_str(&raw_name);
            for attr in event.attributes().with_checks(false).flatten() {
                capture.raw.push_str(&format!(
                    " {}=\"{}\"",
                    String::from_utf8_lossy(attr.key.as_ref()),
                    String::from_utf8_lossy(&attr.value)
                ));
            }
            if self_closing {
                capture.raw.push_str("/>");
            } else {
                capture.raw.push('>');
                capture.open.push(raw_name);
                self.stack.push(ElementName::Other);
            }
            return;
        }

        if self.in_prop() && self.current.is_some() {
            let capture = PropCapture::new(fqname, extract_dt(event));
            if self_closing {
                self.commit_capture(capture);
            } else {
                self.capture = Some(capture);
                self.stack.push(ElementName::Other);
            }
            return;
        }

        let element = element_from_local(local_of(&fqname));
        if element == ElementName::Response {
            self.current = Some(ResponseBlock::new());
        }
        if self_closing {
            if element == ElementName::Response {
                self.finish_response();
            }
        } else {
            self.stack.push(element);
        }
    }

    fn commit_capture(&mut self, capture: PropCapture) {
        if let Some(block) = self.current.as_mut() {
            let (name, value) = capture.finish();
            block.pending.insert(name, value);
        }
    }

    fn on_end(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            self.stack.pop();
            if let Some(open) = capture.open.pop() {
                capture.raw.push_str("</");
                capture.raw.push_str(&open);
                capture.raw.push('>');
                self.capture = Some(capture);
            } else {
                self.commit_capture(capture);
            }
            return;
        }

        match self.stack.pop() {
            Some(ElementName::Response) => self.finish_response(),
            Some(ElementName::Propstat) => {
                if let Some(block) = self.current.as_mut() {
                    block.close_propstat();
                }
            }
            _ => {}
        }
    }

    fn finish_response(&mut self) {
        if let Some(block) = self.current.take()
            && let Some(result) = block.finish()
        {
            self.results.push(result);
        }
    }

    fn on_text(&mut self, text: &str) {
        if let Some(capture) = self.capture.as_mut() {
            if !capture.open.is_empty() {
                if capture.multi_valued() {
                    if let Some(last) = capture.values.last_mut() {
                        last.push_str(text);
                    }
                } else {
                    capture.raw.push_str(&crate::dav::xml::escape_xml(text));
                }
            } else {
                capture.text.push_str(text);
            }
            return;
        }

        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }
        let Some(block) = self.current.as_mut() else {
            return;
        };

        match self.stack.last() {
            Some(ElementName::Href)
                if self.stack.len() >= 2
                    && self.stack[self.stack.len() - 2] == ElementName::Response =>
            {
                block.href = Some(trimmed.to_string());
            }
            // A rename during a bulk move/copy reports the address the
            // item actually landed at.
            Some(ElementName::Href)
                if self.stack.len() >= 2
                    && self.stack[self.stack.len() - 2] == ElementName::Location =>
            {
                block
                    .bag
                    .insert("DAV:location", PropValue::String(trimmed.to_string()));
            }
            Some(ElementName::Status) => {
                let status = parse_status_line(trimmed);
                let under_propstat = self.stack.len() >= 2
                    && self.stack[self.stack.len() - 2] == ElementName::Propstat;
                if under_propstat {
                    block.pending_status = status;
                } else {
                    block.status = status;
                }
            }
            _ => {}
        }
    }
}

fn local_of(fqname: &str) -> &[u8] {
    match fqname.rfind(|c| c == '/' || c == ':') {
        Some(idx) => fqname[idx + 1..].as_bytes(),
        None => fqname.as_bytes(),
    }
}

fn extract_dt(event: &BytesStart<'_>) -> Option<String> {
    for attr in event.attributes().with_checks(false).flatten() {
        let key = attr.key.as_ref();
        let local = match key.iter().position(|b| *b == b':') {
            Some(idx) => &key[idx + 1..],
            None => key,
        };
        if local.eq_ignore_ascii_case(b"dt") {
            return Some(String::from_utf8_lossy(&attr.value).into_owned());
        }
    }
    None
}

/// Decode a multistatus body into one [`DavResult`] per well-formed
/// per-resource block.
pub fn parse_multistatus(body: &[u8]) -> Result<Vec<DavResult>> {
    let mut reader = NsReader::from_reader(body);
    reader.config_mut().trim_text(false);

    let mut parser = MultistatusParser::new();
    let mut buf = Vec::with_capacity(8 * 1024);

    loop {
        match reader.read_resolved_event_into(&mut buf) {
            Ok((resolve, Event::Start(e))) => {
                let fqname = resolve_name(&resolve, &e);
                parser.on_start(fqname, &e, false);
            }
            Ok((resolve, Event::Empty(e))) => {
                let fqname = resolve_name(&resolve, &e);
                parser.on_start(fqname, &e, true);
            }
            Ok((_, Event::Text(e))) => {
                let text = decode_text(e.as_ref())?;
                parser.on_text(&text);
            }
            Ok((_, Event::CData(e))) => {
                let text = String::from_utf8_lossy(e.as_ref()).into_owned();
                parser.on_text(&text);
            }
            Ok((_, Event::End(_))) => parser.on_end(),
            Ok((_, Event::Eof)) => break,
            Err(e) => return Err(Error::Decode(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(parser.results)
}

fn decode_text(raw: &[u8]) -> Result<String> {
    match std::str::from_utf8(raw) {
        Ok(s) => Ok(unescape(s)
            .map_err(|err| Error::Decode(err.to_string()))?
            .into_owned()),
        Err(_) => Ok(String::from_utf8_lossy(raw).into_owned()),
    }
}

fn resolve_name(resolve: &ResolveResult<'_>, event: &BytesStart<'_>) -> String {
    let local = event.local_name();
    let local = String::from_utf8_lossy(local.as_ref()).into_owned();
    match resolve {
        ResolveResult::Bound(ns) => {
            format!("{}{}", String::from_utf8_lossy(ns.0), local)
        }
        _ => local,
    }
}
