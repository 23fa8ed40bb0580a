//! Request view used while computing cache ids and building entries
//!
//! [`CacheRequest`] wraps one incoming request for the duration of a single
//! execution. Besides read access to parameters, attributes, cookies and the
//! session, it owns the per-request caching state: the attribute snapshot,
//! the `generating_id` flag, the uncacheable veto and the [`FragmentInfo`] of
//! the entry being built.

use crate::error::{FragmentError, Result};
use crate::fragment_info::FragmentInfo;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, COOKIE, HOST};
use http::{Method, Request};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Snapshot of request attributes taken just before a fragment executes
pub type AttributeTable = HashMap<String, Value>;

/// Request wrapper seen by generators and the coordinator
#[derive(Debug, Clone)]
pub struct CacheRequest {
    method: Method,
    uri: String,
    query: String,
    host: String,
    parameters: HashMap<String, Vec<String>>,
    attributes: HashMap<String, Value>,
    cookies: HashMap<String, String>,
    session: Option<HashMap<String, String>>,
    body: Bytes,
    top_level: bool,
    generating_id: bool,
    body_read_for_id: bool,
    uncacheable: bool,
    attribute_table: Option<AttributeTable>,
    fragment_info: Option<FragmentInfo>,
}

impl CacheRequest {
    /// Create a top-level request for `uri` (path only)
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        CacheRequest {
            method,
            uri: uri.into(),
            query: String::new(),
            host: "localhost".to_string(),
            parameters: HashMap::new(),
            attributes: HashMap::new(),
            cookies: HashMap::new(),
            session: None,
            body: Bytes::new(),
            top_level: true,
            generating_id: false,
            body_read_for_id: false,
            uncacheable: false,
            attribute_table: None,
            fragment_info: None,
        }
    }

    /// Build a request view from an HTTP request
    ///
    /// Query parameters, `application/x-www-form-urlencoded` bodies, the
    /// `Host` header and the `Cookie` header are decoded.
    pub fn from_http(req: Request<Bytes>) -> Result<Self> {
        let (parts, body) = req.into_parts();

        let host = parts
            .headers
            .get(HOST)
            .map(|h| {
                h.to_str()
                    .map_err(|e| FragmentError::ParseError(format!("Invalid Host header: {}", e)))
            })
            .transpose()?
            .or_else(|| parts.uri.host())
            .unwrap_or("localhost")
            .to_string();

        let mut request = CacheRequest::new(parts.method, parts.uri.path()).with_host(host);

        if let Some(query) = parts.uri.query() {
            for (name, value) in parse_urlencoded(query) {
                request.push_parameter(name, value);
            }
            request.query = query.to_string();
        }

        let is_form = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(false);
        if is_form {
            let form = std::str::from_utf8(&body)
                .map_err(|e| FragmentError::ParseError(format!("Form body is not UTF-8: {}", e)))?;
            for (name, value) in parse_urlencoded(form) {
                request.push_parameter(name, value);
            }
        }

        for header in parts.headers.get_all(COOKIE) {
            let header = header
                .to_str()
                .map_err(|e| FragmentError::ParseError(format!("Invalid Cookie header: {}", e)))?;
            for pair in header.split(';') {
                if let Some((name, value)) = pair.trim().split_once('=') {
                    request.cookies.insert(name.to_string(), value.to_string());
                }
            }
        }

        request.body = body;
        Ok(request)
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Add a query parameter; it also becomes part of [`request_target`](Self::request_target)
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let (name, value) = (name.into(), value.into());
        if !self.query.is_empty() {
            self.query.push('&');
        }
        self.query.push_str(&percent_encode(&name));
        self.query.push('=');
        self.query.push_str(&percent_encode(&value));
        self.push_parameter(name, value);
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn with_session_attribute(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.session
            .get_or_insert_with(HashMap::new)
            .insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    fn push_parameter(&mut self, name: String, value: String) {
        self.parameters.entry(name).or_default().push(value);
    }

    /// Create the request view of a fragment included by this one
    ///
    /// The child shares parameters, attributes, cookies and session; it is
    /// never top-level and has no body.
    pub fn nested(&self, uri: impl Into<String>) -> CacheRequest {
        CacheRequest {
            method: self.method.clone(),
            uri: uri.into(),
            query: self.query.clone(),
            host: self.host.clone(),
            parameters: self.parameters.clone(),
            attributes: self.attributes.clone(),
            cookies: self.cookies.clone(),
            session: self.session.clone(),
            body: Bytes::new(),
            top_level: false,
            generating_id: false,
            body_read_for_id: false,
            uncacheable: false,
            attribute_table: None,
            fragment_info: None,
        }
    }

    /// Take back the attributes a nested fragment left on its request
    pub(crate) fn absorb_attributes(&mut self, child: &CacheRequest) {
        self.attributes = child.attributes.clone();
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Raw query string, empty when there is none
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Path and query as the client addressed them
    ///
    /// Pages pushed to external caches are keyed by this, so two variants of
    /// one resource never share an external copy.
    pub fn request_target(&self) -> String {
        if self.query.is_empty() {
            self.uri.clone()
        } else {
            format!("{}?{}", self.uri, self.query)
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Whether this request is a directly requested page rather than a nested fragment
    pub fn is_top_level(&self) -> bool {
        self.top_level
    }

    /// First value of a request parameter
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn parameter_values(&self, name: &str) -> &[String] {
        self.parameters.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(name.into(), value.into());
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<Value> {
        self.attributes.remove(name)
    }

    pub fn attributes(&self) -> &HashMap<String, Value> {
        &self.attributes
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn session_attribute(&self, name: &str) -> Option<&str> {
        self.session
            .as_ref()
            .and_then(|s| s.get(name))
            .map(String::as_str)
    }

    /// Snapshot of the attributes as they were just before execution
    ///
    /// The table is created on the first call; later calls return the same
    /// table even if attributes changed in between.
    pub fn get_attribute_table(&mut self) -> &AttributeTable {
        let attributes = &self.attributes;
        self.attribute_table
            .get_or_insert_with(|| attributes.clone())
    }

    /// Attributes added or changed since the snapshot was taken
    pub(crate) fn attributes_changed_since_snapshot(&self) -> Vec<(String, Value)> {
        let empty = AttributeTable::new();
        let before = self.attribute_table.as_ref().unwrap_or(&empty);
        let mut changed: Vec<(String, Value)> = self
            .attributes
            .iter()
            .filter(|(name, value)| before.get(*name) != Some(*value))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        changed.sort_by(|a, b| a.0.cmp(&b.0));
        changed
    }

    /// Mark whether the body is being read to compute a cache id
    pub fn set_generating_id(&mut self, generating: bool) {
        self.generating_id = generating;
    }

    pub fn is_generating_id(&self) -> bool {
        self.generating_id
    }

    /// Read the request body
    ///
    /// Reads performed while generating an id are remembered so the body is
    /// replayed to the resource afterwards.
    pub fn read_body(&mut self) -> Bytes {
        if self.generating_id {
            self.body_read_for_id = true;
            debug!("Body of {} consumed for id generation", self.uri);
        }
        self.body.clone()
    }

    /// Whether an id generator consumed the body
    pub fn body_read_for_id(&self) -> bool {
        self.body_read_for_id
    }

    /// Veto caching of the entry being built; never reset automatically
    pub fn set_uncacheable(&mut self, uncacheable: bool) {
        if uncacheable {
            self.uncacheable = true;
        }
    }

    pub fn is_uncacheable(&self) -> bool {
        self.uncacheable
    }

    /// Metadata of the entry being built, if this request is building one
    pub fn fragment_info(&self) -> Option<&FragmentInfo> {
        self.fragment_info.as_ref()
    }

    pub fn fragment_info_mut(&mut self) -> Option<&mut FragmentInfo> {
        self.fragment_info.as_mut()
    }

    pub(crate) fn begin_fragment(&mut self, info: FragmentInfo) {
        self.fragment_info = Some(info);
    }

    pub(crate) fn take_fragment_info(&mut self) -> Option<FragmentInfo> {
        self.fragment_info.take()
    }
}

/// Decode `a=1&b=two+words` style pairs
fn parse_urlencoded(input: &str) -> Vec<(String, String)> {
    input
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) => (percent_decode(name), percent_decode(value)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            other => out.push(other),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
