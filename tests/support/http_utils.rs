use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result, anyhow, bail};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// A response read off the wire, body already de-chunked.
#[derive(Debug)]
pub struct TestResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub chunked: bool,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends a bodiless request with `Connection: close` and parses the reply.
pub async fn send_request(addr: SocketAddr, method: &str, path: &str) -> Result<TestResponse> {
    let raw = format!("{method} {path} HTTP/1.1\r\nHost: proxy.test\r\nConnection: close\r\n\r\n");
    send_raw(addr, raw.as_bytes()).await
}

/// Writes `raw` verbatim and parses the single response that follows.
pub async fn send_raw(addr: SocketAddr, raw: &[u8]) -> Result<TestResponse> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(raw).await?;
    let buf = timeout(StdDuration::from_secs(10), read_until_close(&mut stream))
        .await
        .context("timed out reading proxy response")??;
    parse_response(&buf)
}

/// Reads until EOF. A reset after some bytes arrived counts as EOF: the proxy
/// closes without draining a rejected request body.
async fn read_until_close(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => return Ok(buf),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(err) if err.kind() == ErrorKind::ConnectionReset && !buf.is_empty() => {
                return Ok(buf);
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn parse_response(data: &[u8]) -> Result<TestResponse> {
    let split = data
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .ok_or_else(|| anyhow!("response has no header terminator"))?;
    let head = std::str::from_utf8(&data[..split]).context("response head is not UTF-8")?;
    let rest = &data[split + 4..];

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("missing status code in '{status_line}'"))?
        .parse::<u16>()?;
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    let chunked = headers.iter().any(|(name, value)| {
        name.eq_ignore_ascii_case("transfer-encoding") && value.eq_ignore_ascii_case("chunked")
    });
    let body = if chunked {
        decode_chunked(rest)?
    } else {
        rest.to_vec()
    };

    Ok(TestResponse {
        status,
        headers,
        body,
        chunked,
    })
}

fn decode_chunked(mut data: &[u8]) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let line_end = data
            .windows(2)
            .position(|window| window == b"\r\n")
            .ok_or_else(|| anyhow!("truncated chunk size line"))?;
        let size_text = std::str::from_utf8(&data[..line_end])?;
        let size = usize::from_str_radix(size_text.trim(), 16)?;
        data = &data[line_end + 2..];
        if size == 0 {
            return Ok(body);
        }
        if data.len() < size + 2 {
            bail!("truncated chunk");
        }
        body.extend_from_slice(&data[..size]);
        data = &data[size + 2..];
    }
}
