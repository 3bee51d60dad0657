use derive_more::Display;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::protocol::error::{ModemError, Result};

/// Characters left as-is in query parameters (RFC 3986 unreserved).
const FORM: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Display, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    #[default]
    #[display("GET")]
    Get,
    #[display("POST")]
    Post,
}

#[derive(Debug, Display, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    #[display("http")]
    Http,
    #[display("https")]
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn is_secure(self) -> bool {
        self == Scheme::Https
    }
}

/// Target and headers of one HTTP request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    #[serde(default)]
    pub method: Method,
    #[serde(default)]
    pub scheme: Scheme,
    pub host: String,
    /// Scheme default when absent
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

fn default_path() -> String {
    "/".to_string()
}

impl RequestHeader {
    pub fn new(method: Method, scheme: Scheme, host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method,
            scheme,
            host: host.into(),
            port: None,
            path: path.into(),
            user_agent: None,
            content_type: None,
        }
    }

    pub fn get(scheme: Scheme, host: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::Get, scheme, host, path)
    }

    pub fn post(scheme: Scheme, host: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::Post, scheme, host, path)
    }

    /// Split an absolute `http`/`https` URL into a request header.
    pub fn from_url(method: Method, url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| ModemError::invalid(format!("url {url:?}: {e}")))?;
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => return Err(ModemError::invalid(format!("unsupported scheme {other}"))),
        };
        let host = url
            .host_str()
            .ok_or_else(|| ModemError::invalid("url without host"))?;
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        let mut header = Self::new(method, scheme, host, path);
        header.port = url.port();
        Ok(header)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.scheme.default_port())
    }

    /// Absolute URL of the request.
    pub fn url(&self) -> Result<Url> {
        let mut url = Url::parse(&format!("{}://{}", self.scheme, self.host))
            .map_err(|e| ModemError::invalid(format!("host {:?}: {e}", self.host)))?;
        if self.port.is_some() && url.set_port(self.port).is_err() {
            return Err(ModemError::invalid(format!("port for host {:?}", self.host)));
        }
        let (path, query) = match self.path.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (self.path.as_str(), None),
        };
        url.set_path(path);
        url.set_query(query);
        Ok(url)
    }

    /// Request line and headers for the modem's custom-header mode. The
    /// request line carries `method`, the operation actually sent.
    pub fn render(&self, method: Method, url: &Url, user_agent: &str, body_len: Option<usize>) -> String {
        let mut target = url.path().to_string();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }
        let host = match url.port() {
            Some(port) => format!("{}:{port}", self.host),
            None => self.host.clone(),
        };
        let mut head = format!(
            "{} {target} HTTP/1.1\r\nHost: {host}\r\nUser-Agent: {}\r\nAccept: */*\r\nConnection: keep-alive\r\n",
            method,
            self.user_agent.as_deref().unwrap_or(user_agent)
        );
        if let Some(content_type) = &self.content_type {
            head.push_str(&format!("Content-Type: {content_type}\r\n"));
        }
        if let Some(len) = body_len {
            head.push_str(&format!("Content-Length: {len}\r\n"));
        }
        head.push_str("\r\n");
        head
    }
}

/// Percent-encoded `key=value&...` rendering of `params`.
pub fn encode_params<K: AsRef<str>, V: AsRef<str>>(params: &[(K, V)]) -> String {
    params
        .iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                utf8_percent_encode(k.as_ref(), FORM),
                utf8_percent_encode(v.as_ref(), FORM)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Append `params` to the query string of `url`, after any query it has.
pub fn append_query<K: AsRef<str>, V: AsRef<str>>(url: &mut Url, params: &[(K, V)]) {
    if params.is_empty() {
        return;
    }
    let extra = encode_params(params);
    let query = match url.query() {
        Some(query) if !query.is_empty() => format!("{query}&{extra}"),
        _ => extra,
    };
    url.set_query(Some(&query));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_with_port_and_query() {
        let header = RequestHeader::get(Scheme::Https, "api.example.com", "/v1/assets?page=2").with_port(8443);
        let url = header.url().unwrap();
        assert_eq!(url.as_str(), "https://api.example.com:8443/v1/assets?page=2");
        assert_eq!(header.port(), 8443);
    }

    #[test]
    fn test_default_port_is_omitted() {
        let header = RequestHeader::get(Scheme::Http, "example.com", "status");
        assert_eq!(header.url().unwrap().as_str(), "http://example.com/status");
        assert_eq!(header.port(), 80);
    }

    #[test]
    fn test_from_url() {
        let header = RequestHeader::from_url(Method::Post, "https://ingest.local:9443/v1/data?x=1").unwrap();
        assert_eq!(header.scheme, Scheme::Https);
        assert_eq!(header.host, "ingest.local");
        assert_eq!(header.port(), 9443);
        assert_eq!(header.path, "/v1/data?x=1");
        assert!(RequestHeader::from_url(Method::Get, "ftp://files.local/a").is_err());
    }

    #[test]
    fn test_rejects_bad_host() {
        assert!(RequestHeader::get(Scheme::Http, "bad host", "/").url().is_err());
    }

    #[test]
    fn test_render_custom_header() {
        let header = RequestHeader::post(Scheme::Http, "example.com", "/ingest")
            .with_content_type("application/json");
        let url = header.url().unwrap();
        let head = header.render(Method::Post, &url, "atmux", Some(2));
        assert!(head.starts_with("POST /ingest HTTP/1.1\r\nHost: example.com\r\n"));
        assert!(head.contains("Content-Length: 2\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_render_uses_sent_method() {
        let header = RequestHeader::post(Scheme::Http, "example.com", "/ingest");
        let url = header.url().unwrap();
        let head = header.render(Method::Get, &url, "atmux", None);
        assert!(head.starts_with("GET /ingest HTTP/1.1\r\n"));
        assert!(!head.contains("Content-Length"));
    }

    #[test]
    fn test_append_query() {
        let mut url = RequestHeader::get(Scheme::Http, "example.com", "/form?v=2").url().unwrap();
        append_query(&mut url, &[("name", "gw 1"), ("t", "a&b")]);
        assert_eq!(url.as_str(), "http://example.com/form?v=2&name=gw%201&t=a%26b");

        let mut bare = RequestHeader::get(Scheme::Http, "example.com", "/form").url().unwrap();
        append_query::<&str, &str>(&mut bare, &[]);
        assert_eq!(bare.as_str(), "http://example.com/form");
    }

    #[test]
    fn test_encode_params() {
        assert_eq!(
            encode_params(&[("id", "gw 1"), ("t", "a&b=c"), ("ok", "x-y_z.~")]),
            "id=gw%201&t=a%26b%3Dc&ok=x-y_z.~"
        );
    }
}
