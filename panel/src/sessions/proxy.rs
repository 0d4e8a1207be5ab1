//! Reverse proxy into helper containers
//!
//! The helper does not know it is served under a session prefix, so
//! root-relative references in HTML and JavaScript bodies are rewritten to
//! carry it. Anything else streams through untouched.

use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::response::Response;
use futures::{stream, StreamExt};
use http::header::{self, HeaderMap, HeaderName};
use reqwest::redirect::Policy;
use reqwest::Client;
use tracing::debug;

use crate::errors::PanelError;

/// Largest body read for rewriting; bigger bodies pass through as is
pub const MAX_REWRITE_BYTES: usize = 2 * 1024 * 1024;
/// Largest request body forwarded to a helper
pub const MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 1024;

/// Query parameter carrying the panel's auth token, never forwarded
const TOKEN_PARAM: &str = "token";

const HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

const HTML_REFS: [(&str, &str); 6] = [
    ("\"", "/static/"),
    ("'", "/static/"),
    ("src=", "/static/"),
    ("href=", "/static/"),
    ("\"", "/favicon"),
    ("'", "/favicon"),
];

const SCRIPT_REFS: [(&str, &str); 2] = [("\"", "/api/"), ("'", "/api/")];

/// Kind of body that gets rewritten
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rewritable {
    Html,
    Script,
}

impl Rewritable {
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let content_type = content_type.trim().to_lowercase();
        if content_type.contains("text/html") {
            Some(Rewritable::Html)
        } else if content_type.contains("application/javascript")
            || content_type.contains("text/javascript")
            || content_type.contains("application/x-javascript")
        {
            Some(Rewritable::Script)
        } else {
            None
        }
    }
}

/// Insert `prefix` in front of root-relative references in a single pass.
/// References that already carry the prefix are left alone.
pub fn rewrite_body(body: &str, prefix: &str, kind: Rewritable) -> String {
    let refs: Vec<(&str, &str)> = match kind {
        Rewritable::Html => HTML_REFS.iter().chain(SCRIPT_REFS.iter()).copied().collect(),
        Rewritable::Script => SCRIPT_REFS.to_vec(),
    };

    let mut out = String::with_capacity(body.len());
    let mut i = 0;
    'scan: while i < body.len() {
        let rest = &body[i..];
        for (lead, path) in &refs {
            if let Some(after_lead) = rest.strip_prefix(lead) {
                if after_lead.starts_with(prefix) {
                    out.push_str(lead);
                    out.push_str(prefix);
                    i += lead.len() + prefix.len();
                    continue 'scan;
                }
                if after_lead.starts_with(path) {
                    out.push_str(lead);
                    out.push_str(prefix);
                    out.push_str(path);
                    i += lead.len() + path.len();
                    continue 'scan;
                }
            }
        }
        let Some(c) = rest.chars().next() else {
            break;
        };
        out.push(c);
        i += c.len_utf8();
    }
    out
}

/// Query string without the auth token
pub fn strip_token(query: &str) -> String {
    url::form_urlencoded::parse(query.as_bytes())
        .filter(|(key, _)| key != TOKEN_PARAM)
        .fold(url::form_urlencoded::Serializer::new(String::new()), |mut s, (k, v)| {
            s.append_pair(&k, &v);
            s
        })
        .finish()
}

fn forwardable_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in &HOP_BY_HOP {
        out.remove(name);
    }
    out.remove(header::HOST);
    for name in ["x-forwarded-host", "x-forwarded-proto", "x-forwarded-for"] {
        out.remove(name);
    }
    out
}

/// Forwards requests to helper containers
pub struct SessionProxy {
    client: Client,
}

impl SessionProxy {
    pub fn new(timeout: Duration) -> Result<Self, PanelError> {
        let client = Client::builder()
            .redirect(Policy::none())
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Forward `request` to `http://{address}{subpath}`
    pub async fn forward(
        &self,
        address: &str,
        prefix: &str,
        subpath: &str,
        request: Request,
    ) -> Result<Response, PanelError> {
        let (parts, body) = request.into_parts();

        let path = if subpath.starts_with('/') {
            subpath.to_string()
        } else {
            format!("/{}", subpath)
        };
        let mut target = format!("http://{}{}", address, path);
        let query = strip_token(parts.uri.query().unwrap_or_default());
        if !query.is_empty() {
            target.push('?');
            target.push_str(&query);
        }
        debug!("Proxy {} {}", parts.method, target);

        let body = axum::body::to_bytes(body, MAX_UPLOAD_BYTES)
            .await
            .map_err(|e| PanelError::ValidationError(format!("request body: {}", e)))?;

        let upstream = self
            .client
            .request(parts.method, target)
            .headers(forwardable_request_headers(&parts.headers))
            .body(body)
            .send()
            .await
            .map_err(|e| PanelError::ProxyError(e.to_string()))?;

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        for name in &HOP_BY_HOP {
            headers.remove(name);
        }

        let rewritable = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(Rewritable::from_content_type);

        let body = match rewritable {
            Some(kind) => {
                headers.remove(header::CONTENT_LENGTH);
                rewrite_response(upstream, prefix, kind).await?
            }
            None => Body::from_stream(upstream.bytes_stream()),
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Read up to `MAX_REWRITE_BYTES` and rewrite it; a longer body is passed on
/// unmodified, the already read part first
async fn rewrite_response(
    mut upstream: reqwest::Response,
    prefix: &str,
    kind: Rewritable,
) -> Result<Body, PanelError> {
    let mut buffered: Vec<u8> = Vec::new();
    while let Some(chunk) = upstream
        .chunk()
        .await
        .map_err(|e| PanelError::ProxyError(e.to_string()))?
    {
        buffered.extend_from_slice(&chunk);
        if buffered.len() > MAX_REWRITE_BYTES {
            debug!("Body exceeds {} bytes, passing through", MAX_REWRITE_BYTES);
            let head = stream::once(async move { Ok::<Bytes, reqwest::Error>(Bytes::from(buffered)) });
            return Ok(Body::from_stream(head.chain(upstream.bytes_stream())));
        }
    }

    let text = match String::from_utf8(buffered) {
        Ok(text) => text,
        Err(e) => return Ok(Body::from(e.into_bytes())),
    };
    Ok(Body::from(rewrite_body(&text, prefix, kind)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "/api/volumes/browse/abc/fb";

    #[test]
    fn test_rewrite_html() {
        let html = r#"<link href="/static/app.css"><script src=/static/app.js></script><link rel=icon href='/favicon.ico'><script>fetch("/api/resources")</script>"#;
        let out = rewrite_body(html, PREFIX, Rewritable::Html);
        assert_eq!(
            out,
            r#"<link href="/api/volumes/browse/abc/fb/static/app.css"><script src=/api/volumes/browse/abc/fb/static/app.js></script><link rel=icon href='/api/volumes/browse/abc/fb/favicon.ico'><script>fetch("/api/volumes/browse/abc/fb/api/resources")</script>"#
        );
    }

    #[test]
    fn test_rewrite_is_not_applied_twice() {
        let html = r#"<a href="/api/volumes/browse/abc/fb/static/x.js">"#;
        assert_eq!(rewrite_body(html, PREFIX, Rewritable::Html), html);
    }

    #[test]
    fn test_rewrite_script_only_touches_api() {
        let js = r#"const a = "/static/x"; const b = '/api/raw';"#;
        assert_eq!(
            rewrite_body(js, PREFIX, Rewritable::Script),
            r#"const a = "/static/x"; const b = '/api/volumes/browse/abc/fb/api/raw';"#
        );
    }

    #[test]
    fn test_rewrite_keeps_multibyte_text() {
        let html = "<p>卷 \"/static/é\"</p>";
        assert_eq!(
            rewrite_body(html, PREFIX, Rewritable::Html),
            "<p>卷 \"/api/volumes/browse/abc/fb/static/é\"</p>"
        );
    }

    #[test]
    fn test_content_types() {
        assert_eq!(Rewritable::from_content_type("text/html; charset=utf-8"), Some(Rewritable::Html));
        assert_eq!(Rewritable::from_content_type("application/javascript"), Some(Rewritable::Script));
        assert_eq!(Rewritable::from_content_type("image/png"), None);
    }

    #[test]
    fn test_strip_token() {
        assert_eq!(strip_token("token=secret&path=%2Fsrv"), "path=%2Fsrv");
        assert_eq!(strip_token("token=secret"), "");
        assert_eq!(strip_token(""), "");
    }
}
