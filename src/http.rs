use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::{Client as HttpClient, Response};
use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER, USER_AGENT};
use serde_json::Value;

use crate::compiler::PageRequest;
use crate::error::{TransportError, describe_rejection, retriable_status};
use crate::transport::{Connection, RawPage, RawRecord, Transport};

/// AFLUX over HTTP. Cloning is cheap and shares the connection pool.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    url: String,
    verify: bool,
    http: HttpClient,
}

impl HttpTransport {
    /// `url` is the AFLUX endpoint including the trailing `?`.
    pub fn new(url: impl Into<String>, timeout: Duration, verify: bool) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("aflow-rs/{}", env!("CARGO_PKG_VERSION")))
                .unwrap_or(HeaderValue::from_static("aflow-rs")),
        );

        let mut builder = HttpClient::builder()
            .default_headers(default_headers)
            .timeout(timeout);

        if !verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder.build().context("failed to build HTTP client")?;

        Ok(Self {
            url: url.into(),
            verify,
            http,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn verifies_tls(&self) -> bool {
        self.verify
    }

    /// Full URL for one page. AFLUX pages are 1-based.
    pub(crate) fn page_url(&self, request: &PageRequest<'_>) -> Result<String, TransportError> {
        let page = match request.token() {
            None => 1,
            Some(t) => t
                .parse::<u64>()
                .map_err(|_| TransportError::Decode(format!("invalid page cursor `{}`", t)))?,
        };
        Ok(format!(
            "{}{},$paging({},{}),format(json)",
            self.url,
            request.compiled.matchbook(),
            page,
            request.compiled.page_size()
        ))
    }

    /// Plain GET with the same error mapping as page requests.
    pub(crate) fn get_text(&self, url: &str) -> Result<String, TransportError> {
        let resp = self.http.get(url).send().map_err(map_reqwest)?;
        check_status(resp, url)?.text().map_err(map_reqwest)
    }
}

impl Transport for HttpTransport {
    type Connection = HttpConnection;

    fn connect(&self) -> Result<HttpConnection, TransportError> {
        Ok(HttpConnection {
            transport: self.clone(),
        })
    }
}

/// Scoped handle on the transport's pool for one running query.
#[derive(Debug)]
pub struct HttpConnection {
    transport: HttpTransport,
}

impl Connection for HttpConnection {
    fn send(&mut self, request: &PageRequest<'_>) -> Result<RawPage, TransportError> {
        let url = self.transport.page_url(request)?;
        tracing::debug!(%url, "GET");
        let text = self.transport.get_text(&url)?;
        let records = parse_entries(&text)?;

        let page: u64 = request.token().and_then(|t| t.parse().ok()).unwrap_or(1);
        let full = records.len() >= request.compiled.page_size();
        Ok(RawPage {
            next_cursor: full.then(|| (page + 1).to_string()),
            records,
            total_matches: None,
        })
    }
}

fn map_reqwest(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_builder() || err.is_redirect() {
        TransportError::Request(err.to_string())
    } else if err.is_body() {
        TransportError::Interrupted(err.to_string())
    } else if err.is_decode() {
        TransportError::Decode(err.to_string())
    } else {
        TransportError::Connect(err.to_string())
    }
}

/// `Retry-After` in its delay-seconds form. HTTP dates are ignored and the
/// executor falls back to its own backoff.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn check_status(resp: Response, url: &str) -> Result<Response, TransportError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(TransportError::RateLimited {
            retry_after: parse_retry_after(resp.headers()),
        });
    }

    let body = resp.text().unwrap_or_default();
    let message = if retriable_status(status.as_u16()) {
        body.trim().to_string()
    } else {
        describe_rejection(status, url, &body)
    };
    Err(TransportError::Status {
        code: status.as_u16(),
        message,
    })
}

/// AFLUX answers either a JSON array of entries or an object keyed by
/// position ("1 of 250", ...).
pub(crate) fn parse_entries(text: &str) -> Result<Vec<RawRecord>, TransportError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| TransportError::Decode(format!("AFLUX response is not JSON: {}", e)))?;

    let entries = match value {
        Value::Array(items) => items,
        Value::Object(map) => {
            let mut keyed = map.into_iter().collect::<Vec<_>>();
            keyed.sort_by_key(|(k, _)| leading_number(k));
            keyed.into_iter().map(|(_, v)| v).collect()
        }
        other => {
            return Err(TransportError::Decode(format!(
                "expected a list of entries, got {}",
                other
            )));
        }
    };

    entries
        .into_iter()
        .map(|e| match e {
            Value::Object(map) => Ok(map),
            other => Err(TransportError::Decode(format!(
                "entry is not an object: {}",
                other
            ))),
        })
        .collect()
}

fn leading_number(key: &str) -> u64 {
    key.split_whitespace()
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(u64::MAX)
}

/// Raises any transport error as an `anyhow` error with context.
pub(crate) fn fetch(transport: &HttpTransport, url: &str) -> Result<String> {
    match transport.get_text(url) {
        Ok(text) => Ok(text),
        Err(TransportError::Status { code, message }) => {
            bail!("request failed: HTTP {} for url ({})\n{}", code, url, message)
        }
        Err(e) => Err(e).with_context(|| format!("request failed for url ({})", url)),
    }
}
