use std::collections::HashMap;
use std::net::SocketAddr;

/// A single logical header: one name, any number of values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    name: String,
    values: Vec<String>,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl IntoHeaderValues) -> Self {
        Self {
            name: name.into(),
            values: value.into_header_values(),
        }
    }

    pub fn with_values(name: String, values: Vec<String>) -> Self {
        Self { name, values }
    }

    /// The display casing the header was first created with.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut Vec<String> {
        &mut self.values
    }

    pub fn push(&mut self, value: impl Into<String>) {
        self.values.push(value.into());
    }

    pub fn get(&self, idx: usize) -> Option<&str> {
        self.values.get(idx).map(String::as_str)
    }

    pub fn first(&self) -> Option<&str> {
        self.get(0)
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Conversion of anything that may be assigned to a header into its value
/// list. Scalars become a single value, `None` becomes no values and
/// sequences are copied.
pub trait IntoHeaderValues {
    fn into_header_values(self) -> Vec<String>;
}

impl IntoHeaderValues for &str {
    fn into_header_values(self) -> Vec<String> {
        vec![self.to_owned()]
    }
}

impl IntoHeaderValues for String {
    fn into_header_values(self) -> Vec<String> {
        vec![self]
    }
}

impl IntoHeaderValues for &String {
    fn into_header_values(self) -> Vec<String> {
        vec![self.clone()]
    }
}

macro_rules! numeric_header_values {
    ($($t:ty),*) => {
        $(
            impl IntoHeaderValues for $t {
                fn into_header_values(self) -> Vec<String> {
                    vec![self.to_string()]
                }
            }
        )*
    };
}

numeric_header_values!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

impl<T: IntoHeaderValues> IntoHeaderValues for Option<T> {
    fn into_header_values(self) -> Vec<String> {
        self.map(IntoHeaderValues::into_header_values)
            .unwrap_or_default()
    }
}

impl<T: AsRef<str>> IntoHeaderValues for Vec<T> {
    fn into_header_values(self) -> Vec<String> {
        self.iter().map(|v| v.as_ref().to_owned()).collect()
    }
}

impl<T: AsRef<str>> IntoHeaderValues for &[T] {
    fn into_header_values(self) -> Vec<String> {
        self.iter().map(|v| v.as_ref().to_owned()).collect()
    }
}

/// Case-insensitive header store that remembers insertion order and the
/// casing each header was first set with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderCollection {
    headers: Vec<Header>,
}

impl HeaderCollection {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h.matches(name))
    }

    /// Non-creating lookup.
    pub fn get(&self, name: &str) -> Option<&Header> {
        self.position(name).map(|i| &self.headers[i])
    }

    /// Lookup that inserts an empty header under `name` when it is missing.
    pub fn get_or_create(&mut self, name: &str) -> &mut Header {
        self.get_or_set(name, None::<&str>)
    }

    /// Returns the existing header, or creates it holding `default`.
    pub fn get_or_set(&mut self, name: &str, default: impl IntoHeaderValues) -> &mut Header {
        let idx = match self.position(name) {
            Some(i) => i,
            None => {
                self.headers.push(Header::new(name, default));
                self.headers.len() - 1
            }
        };
        &mut self.headers[idx]
    }

    /// Removes any header named `name` and recreates it holding `value`.
    pub fn replace(&mut self, name: &str, value: impl IntoHeaderValues) -> &mut Header {
        self.remove(name);
        self.headers.push(Header::new(name, value));
        let last = self.headers.len() - 1;
        &mut self.headers[last]
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.pop(name).is_some()
    }

    pub fn pop(&mut self, name: &str) -> Option<Header> {
        self.position(name).map(|i| self.headers.remove(i))
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Header::first)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.headers.iter()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Writes the header block, including the terminating blank line.
    /// Headers left without values (e.g. auto-created by a lookup) are not
    /// emitted.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        for header in self.headers.iter().filter(|h| !h.is_empty()) {
            out.extend_from_slice(header.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(header.values.join(", ").as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
    }
}

/// Parts common to requests and responses.
pub trait HttpMessage {
    fn version(&self) -> &str;
    fn set_version(&mut self, version: String);
    fn headers(&self) -> &HeaderCollection;
    fn headers_mut(&mut self) -> &mut HeaderCollection;
    fn start_line(&self) -> String;

    /// Start line plus header block. Bodies are relayed separately.
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.start_line().into_bytes();
        out.extend_from_slice(b"\r\n");
        self.headers().write_to(&mut out);
        out
    }
}

/// Scratch data filters may share. Never written to the wire.
pub type LocalData = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    pub url: String,
    pub client_address: Option<SocketAddr>,
    pub version: String,
    pub headers: HeaderCollection,
    pub local_data: LocalData,
    /// Response bytes to hold back before the first write to the client.
    pub peek_size: usize,
}

impl Request {
    pub fn new() -> Self {
        Self {
            method: String::new(),
            url: String::new(),
            client_address: None,
            version: String::from("1.1"),
            headers: HeaderCollection::new(),
            local_data: LocalData::new(),
            peek_size: 0,
        }
    }

    pub fn with_client(client_address: SocketAddr) -> Self {
        Self {
            client_address: Some(client_address),
            ..Self::new()
        }
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpMessage for Request {
    fn version(&self) -> &str {
        &self.version
    }

    fn set_version(&mut self, version: String) {
        self.version = version;
    }

    fn headers(&self) -> &HeaderCollection {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderCollection {
        &mut self.headers
    }

    fn start_line(&self) -> String {
        format!("{} {} HTTP/{}", self.method, self.url, self.version)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Status code and optional reason phrase, e.g. `"502 Bad Gateway"`.
    pub status: String,
    pub version: String,
    pub headers: HeaderCollection,
    pub local_data: LocalData,
    pub peek_size: usize,
}

impl Response {
    pub fn new() -> Self {
        Self {
            status: String::new(),
            version: String::from("1.1"),
            headers: HeaderCollection::new(),
            local_data: LocalData::new(),
            peek_size: 0,
        }
    }

    pub fn with_status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            ..Self::new()
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status.split_whitespace().next()?.parse().ok()
    }

    pub fn is_informational(&self) -> bool {
        matches!(self.status_code(), Some(100..=199))
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpMessage for Response {
    fn version(&self) -> &str {
        &self.version
    }

    fn set_version(&mut self, version: String) {
        self.version = version;
    }

    fn headers(&self) -> &HeaderCollection {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderCollection {
        &mut self.headers
    }

    fn start_line(&self) -> String {
        format!("HTTP/{} {}", self.version, self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_casing_reaches_the_same_header() {
        let mut headers = HeaderCollection::new();
        headers.get_or_create("aA").push("1");
        headers.get_or_create("A").push("2");
        headers.get_or_create("a").push("3");
        headers.get_or_create("AA").push("4");

        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("a").map(Header::values).unwrap(), ["2", "3"]);
        assert_eq!(headers.get("aa").map(Header::name), Some("aA"));

        let mut out = Vec::new();
        headers.write_to(&mut out);
        assert_eq!(out, b"aA: 1, 4\r\nA: 2, 3\r\n\r\n");
    }

    #[test]
    fn replace_leaves_exactly_the_new_value() {
        let mut headers = HeaderCollection::new();
        headers.get_or_set("Content-Length", 10u64);
        headers.get_or_create("content-length").push("11");

        headers.replace("CONTENT-LENGTH", "0");
        assert_eq!(headers.get("content-length").unwrap().values(), ["0"]);
        assert_eq!(headers.iter().filter(|h| h.matches("content-length")).count(), 1);

        headers.replace("X-Missing", vec!["a", "b"]);
        assert_eq!(headers.get("x-missing").unwrap().values(), ["a", "b"]);
    }

    #[test]
    fn reads_do_not_create_headers() {
        let mut headers = HeaderCollection::new();
        assert!(headers.get("host").is_none());
        assert_eq!(headers.first("host"), None);
        assert!(!headers.remove("host"));
        assert!(headers.pop("host").is_none());
        assert!(headers.is_empty());

        assert!(headers.get_or_create("host").is_empty());
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn get_or_set_keeps_existing_values() {
        let mut headers = HeaderCollection::new();
        headers.get_or_set("Via", "1.1 a");
        let via = headers.get_or_set("via", "1.1 b");
        assert_eq!(via.values(), ["1.1 a"]);
        assert_eq!(headers.get_or_set("X-None", None::<String>).len(), 0);
    }

    #[test]
    fn serializes_in_insertion_order() {
        let mut request = Request::new();
        request.method = "GET".into();
        request.url = "/".into();
        request.headers.get_or_set("Host", "a.com");
        request.headers.get_or_set("X", vec!["1", "2"]);
        request.local_data.insert("seen".into(), serde_json::json!(true));

        assert_eq!(
            request.to_bytes(),
            b"GET / HTTP/1.1\r\nHost: a.com\r\nX: 1, 2\r\n\r\n"
        );
    }

    #[test]
    fn response_start_line() {
        let mut response = Response::with_status("404 Not Found");
        response.version = "1.0".into();
        assert_eq!(response.to_bytes(), b"HTTP/1.0 404 Not Found\r\n\r\n");
        assert_eq!(response.status_code(), Some(404));
        assert!(!response.is_informational());
        assert!(Response::with_status("100 Continue").is_informational());
    }
}
