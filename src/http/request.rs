//! A parsed HTTP request: method, path, query, headers, body, plus the
//! router/middleware-populated slots (path params, user id, context).

use std::any::Any;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Invalid,
    Get,
    Post,
    Head,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Invalid => "INVALID",
        }
    }

    fn from_bytes(bytes: &[u8]) -> Method {
        match bytes {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"HEAD" => Method::Head,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            _ => Method::Invalid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Unknown,
    Http10,
    Http11,
}

/// Header map keyed by lower-cased field name, so lookups are a direct
/// `HashMap` hit and two headers differing only by case never end up as
/// separate entries.
#[derive(Debug, Clone, Default)]
pub struct Headers(HashMap<String, String>);

impl Headers {
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.0.insert(field.into().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(&field.to_ascii_lowercase()).map(|v| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

pub struct Request {
    method: Method,
    version: Version,
    path: String,
    query: String,
    headers: Headers,
    body: Vec<u8>,
    params: HashMap<String, String>,
    user_id: i64,
    context: Option<Box<dyn Any + Send>>,
}

impl Default for Request {
    fn default() -> Self {
        Request {
            method: Method::Invalid,
            version: Version::Unknown,
            path: String::new(),
            query: String::new(),
            headers: Headers::default(),
            body: Vec::new(),
            params: HashMap::new(),
            user_id: -1,
            context: None,
        }
    }
}

impl Request {
    pub fn new() -> Self {
        Request::default()
    }

    pub fn set_method(&mut self, raw: &[u8]) -> bool {
        self.method = Method::from_bytes(raw);
        self.method != Method::Invalid
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn set_path(&mut self, raw: &[u8]) {
        self.path = String::from_utf8_lossy(raw).into_owned();
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_query(&mut self, raw: &[u8]) {
        self.query = String::from_utf8_lossy(raw).into_owned();
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Adds a header from raw `field: value` slices, trimming surrounding
    /// whitespace from both sides the way the wire format allows.
    pub fn add_header(&mut self, field: &[u8], value: &[u8]) {
        let field = String::from_utf8_lossy(field).trim().to_string();
        let value = String::from_utf8_lossy(value).trim().to_string();
        self.headers.insert(field, value);
    }

    pub fn header(&self, field: &str) -> Option<&str> {
        self.headers.get(field)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    pub fn append_body(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_user_id(&mut self, id: i64) {
        self.user_id = id;
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn set_params(&mut self, params: HashMap<String, String>) {
        self.params = params;
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|s| s.as_str())
    }

    pub fn set_context(&mut self, ctx: Box<dyn Any + Send>) {
        self.context = Some(ctx);
    }

    pub fn context(&self) -> Option<&(dyn Any + Send)> {
        self.context.as_deref()
    }
}
