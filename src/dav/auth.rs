//! Authentication modes and the forms-based login flow.
//!
//! Basic credentials travel as a header on every request. Forms-based
//! authentication (FBA) servers answer with an HTML login page instead of a
//! protocol challenge; the engine scrapes that form, posts the credentials
//! to the discovered action address, and carries the returned session
//! cookies on subsequent requests.

use hyper::{HeaderMap, header};

use crate::error::AuthFailure;

/// How a connection authenticates its requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMode {
    /// `Authorization: Basic` on every request.
    Basic,
    /// Challenge-response (NTLM-style). Token generation belongs to the
    /// host's security provider; the engine recognizes the challenge and
    /// classifies mismatches so the caller can switch modes.
    Challenge,
    /// Forms-based login with a session cookie.
    Forms,
}

#[derive(Clone, Debug)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Host-provided credential storage, consulted only when the forms-auth
/// flow needs a password the connection was not given directly.
pub trait CredentialStore: Send + Sync {
    fn load(&self, key: &str) -> Option<Credentials>;
    fn forget(&self, key: &str);
    fn prompt_and_save(&self, key: &str) -> Option<Credentials>;
}

/// Classify a 401 by comparing the offered schemes against our mode, so a
/// caller can tell "wrong password" from "server wants a different
/// mechanism" and retry itself.
pub fn classify_unauthorized(headers: &HeaderMap, mode: AuthMode) -> AuthFailure {
    let mut offers_basic = false;
    let mut offers_challenge = false;
    for value in headers.get_all(header::WWW_AUTHENTICATE) {
        let Ok(v) = value.to_str() else { continue };
        let v = v.to_ascii_lowercase();
        if v.starts_with("basic") {
            offers_basic = true;
        }
        if v.starts_with("ntlm") || v.starts_with("negotiate") {
            offers_challenge = true;
        }
    }
    match mode {
        AuthMode::Basic if !offers_basic && offers_challenge => AuthFailure::WrongMode,
        AuthMode::Challenge if !offers_challenge && offers_basic => AuthFailure::WrongMode,
        _ => AuthFailure::BadCredentials,
    }
}

/// A scraped login form: where to POST and which hidden fields to echo.
#[derive(Debug, Default, PartialEq)]
pub struct LoginForm {
    pub action: String,
    /// Hidden inputs, echoed back verbatim.
    pub hidden: Vec<(String, String)>,
    /// Name of the first text input, if the page names one.
    pub username_field: Option<String>,
    /// Name of the first password input, if the page names one.
    pub password_field: Option<String>,
}

/// Tolerant scan of a login page for its first `<form>`. Login pages are
/// rarely well-formed XML, so this walks tags by hand instead of going
/// through an XML parser.
pub fn parse_login_form(html: &str) -> Option<LoginForm> {
    let lower = html.to_ascii_lowercase();
    let form_at = lower.find("<form")?;
    let form_tag_end = lower[form_at..].find('>')? + form_at;
    let form_close = lower[form_at..]
        .find("</form")
        .map(|i| i + form_at)
        .unwrap_or(html.len());

    let mut form = LoginForm {
        action: attr_value(&html[form_at..=form_tag_end], "action").unwrap_or_default(),
        ..LoginForm::default()
    };

    let mut at = form_tag_end;
    while let Some(rel) = lower[at..form_close].find("<input") {
        let start = at + rel;
        let Some(end_rel) = lower[start..].find('>') else {
            break;
        };
        let tag = &html[start..=start + end_rel];
        let kind = attr_value(tag, "type")
            .unwrap_or_else(|| "text".to_string())
            .to_ascii_lowercase();
        let name = attr_value(tag, "name");
        match kind.as_str() {
            "hidden" => {
                if let Some(name) = name {
                    form.hidden
                        .push((name, attr_value(tag, "value").unwrap_or_default()));
                }
            }
            "text" => {
                if form.username_field.is_none() {
                    form.username_field = name;
                }
            }
            "password" => {
                if form.password_field.is_none() {
                    form.password_field = name;
                }
            }
            _ => {}
        }
        at = start + end_rel;
    }

    if form.action.is_empty() {
        None
    } else {
        Some(form)
    }
}

fn attr_value(tag: &str, attr: &str) -> Option<String> {
    let lower = tag.to_ascii_lowercase();
    let mut search = 0;
    loop {
        let at = lower[search..].find(attr)? + search;
        let rest = lower[at + attr.len()..].trim_start();
        if !rest.starts_with('=') {
            search = at + attr.len();
            continue;
        }
        let offset = tag.len() - rest.len() + 1;
        let value = tag[offset..].trim_start();
        return Some(match value.chars().next() {
            Some(q @ ('"' | '\'')) => {
                let inner = &value[1..];
                inner[..inner.find(q).unwrap_or(inner.len())].to_string()
            }
            _ => value
                .split(|c: char| c.is_whitespace() || c == '>')
                .next()
                .unwrap_or("")
                .to_string(),
        });
    }
}

/// Percent-encode form fields the way browsers submit
/// `application/x-www-form-urlencoded`.
pub fn form_urlencode(pairs: &[(String, String)]) -> String {
    fn push_encoded(out: &mut String, raw: &str) {
        for byte in raw.bytes() {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    out.push(byte as char)
                }
                b' ' => out.push('+'),
                _ => out.push_str(&format!("%{:02X}", byte)),
            }
        }
    }

    let mut out = String::new();
    for (idx, (name, value)) in pairs.iter().enumerate() {
        if idx > 0 {
            out.push('&');
        }
        push_encoded(&mut out, name);
        out.push('=');
        push_encoded(&mut out, value);
    }
    out
}

/// Collect the session cookies from a login response's `Set-Cookie`
/// headers into one `Cookie` header value.
pub fn session_cookies(headers: &HeaderMap) -> Option<String> {
    let mut cookies = Vec::new();
    for value in headers.get_all(header::SET_COOKIE) {
        let Ok(v) = value.to_str() else { continue };
        let pair = v.split(';').next().unwrap_or("").trim();
        if !pair.is_empty() {
            cookies.push(pair.to_string());
        }
    }
    if cookies.is_empty() {
        None
    } else {
        Some(cookies.join("; "))
    }
}
