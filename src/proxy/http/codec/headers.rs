use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{HeaderMap, HeaderName, HeaderValue};

use crate::proxy::forward_limits::HeaderBudget;
use crate::proxy::headers::forwards_request_header;

/// A client's request header section. Framing and connection headers are
/// interpreted as they arrive; end-to-end headers are kept for the upstream.
pub(crate) struct RequestHeaders {
    budget: HeaderBudget,
    bytes: usize,
    end_to_end: HeaderMap,
    host: Option<String>,
    content_length: Option<usize>,
    chunked: bool,
    connection: Vec<String>,
    expect: Vec<String>,
}

impl RequestHeaders {
    pub fn new(max_bytes: usize) -> Result<Self> {
        Ok(Self {
            budget: HeaderBudget::new(max_bytes, "request headers exceed configured limit")?,
            bytes: 0,
            end_to_end: HeaderMap::new(),
            host: None,
            content_length: None,
            chunked: false,
            connection: Vec::new(),
            expect: Vec::new(),
        })
    }

    /// Consumes one raw line. Returns `Ok(false)` on the blank line that ends the section.
    pub fn push_line(&mut self, line: &str) -> Result<bool> {
        self.budget.record(line.len())?;
        self.bytes += line.len();
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Ok(false);
        }

        let (raw_name, raw_value) = line
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator"))?;
        if raw_name.is_empty() || raw_name.ends_with([' ', '\t']) {
            bail!("invalid header name '{raw_name}'");
        }
        let name = HeaderName::from_bytes(raw_name.as_bytes())
            .map_err(|_| anyhow!("invalid header name '{raw_name}'"))?;
        let value = raw_value.trim();

        match name.as_str() {
            "host" => {
                ensure!(self.host.is_none(), "duplicate Host header");
                ensure!(!value.is_empty(), "Host header must not be empty");
                self.host = Some(value.to_ascii_lowercase());
            }
            "content-length" => {
                ensure!(
                    self.content_length.is_none(),
                    "multiple Content-Length headers are not supported"
                );
                let length = value
                    .parse()
                    .with_context(|| format!("invalid Content-Length value '{value}'"))?;
                self.content_length = Some(length);
            }
            "transfer-encoding" => {
                ensure!(!self.chunked, "duplicate Transfer-Encoding header");
                ensure!(
                    value.eq_ignore_ascii_case("chunked"),
                    "unsupported Transfer-Encoding '{value}'"
                );
                self.chunked = true;
            }
            "connection" => self.connection.extend(
                value
                    .split(',')
                    .map(|token| token.trim().to_ascii_lowercase())
                    .filter(|token| !token.is_empty()),
            ),
            "expect" => self.expect.push(value.to_string()),
            _ => {}
        }
        ensure!(
            !(self.chunked && self.content_length.is_some()),
            "request must not include both Content-Length and Transfer-Encoding"
        );

        if forwards_request_header(name.as_str()) {
            let value = HeaderValue::from_bytes(value.as_bytes())
                .with_context(|| format!("invalid value for header '{name}'"))?;
            self.end_to_end.append(name, value);
        }
        Ok(true)
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    /// Bytes consumed so far, including line terminators.
    pub fn total_bytes(&self) -> usize {
        self.bytes
    }

    /// End-to-end headers minus any the client listed in `Connection`.
    pub fn forward_header_map(&self) -> HeaderMap {
        let mut map = self.end_to_end.clone();
        for token in &self.connection {
            map.remove(token.as_str());
        }
        map
    }

    pub fn expect_continue(&self) -> Result<bool> {
        match self.expect.as_slice() {
            [] => Ok(false),
            [value] if value.eq_ignore_ascii_case("100-continue") => Ok(true),
            [value] => bail!("unsupported Expect header value '{value}'"),
            _ => bail!("multiple Expect headers are not supported"),
        }
    }

    pub fn wants_connection_close(&self) -> bool {
        self.connection.iter().any(|token| token == "close")
    }
}
