//! Optional self-improve input: a file, a URL, or inline text.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const MAX_INPUT_BYTES: u64 = 512_000;
pub const URL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    None,
    File,
    Text,
    Url,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputPayload {
    pub kind: InputKind,
    #[serde(rename = "ref")]
    pub reference: Option<String>,
    pub content: String,
}

impl InputPayload {
    pub fn none() -> Self {
        Self {
            kind: InputKind::None,
            reference: None,
            content: String::new(),
        }
    }

    /// Whether the payload gives the goal any context to work from.
    pub fn has_context(&self) -> bool {
        self.kind != InputKind::None
    }
}

/// Classify and read an optional input reference, fetching URLs over HTTP.
pub fn read_optional_input(reference: Option<&str>) -> Result<InputPayload> {
    read_input_with(reference, fetch_url)
}

/// Like [`read_optional_input`] with a caller-supplied URL fetcher.
///
/// Files and fetched bodies are capped at [`MAX_INPUT_BYTES`] and decoded
/// lossily. A failed fetch still yields a `url` payload, with empty content.
pub fn read_input_with<F>(reference: Option<&str>, fetch: F) -> Result<InputPayload>
where
    F: FnOnce(&str) -> Result<String>,
{
    let Some(reference) = reference.map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(InputPayload::none());
    };
    if reference.starts_with("http://") || reference.starts_with("https://") {
        let content = fetch(reference).unwrap_or_else(|err| {
            warn!(url = reference, error = %format!("{err:#}"), "input fetch failed");
            String::new()
        });
        return Ok(InputPayload {
            kind: InputKind::Url,
            reference: Some(reference.to_string()),
            content,
        });
    }
    let path = Path::new(reference);
    if path.is_file() {
        let file = File::open(path).with_context(|| format!("open input {}", path.display()))?;
        let content = read_capped(file).with_context(|| format!("read input {}", path.display()))?;
        return Ok(InputPayload {
            kind: InputKind::File,
            reference: Some(reference.to_string()),
            content,
        });
    }
    Ok(InputPayload {
        kind: InputKind::Text,
        reference: None,
        content: reference.to_string(),
    })
}

/// GET `url` with [`URL_TIMEOUT`] and return the capped, lossily decoded body.
pub fn fetch_url(url: &str) -> Result<String> {
    let client = Client::builder()
        .timeout(URL_TIMEOUT)
        .build()
        .context("build http client")?;
    fetch_with(&client, url)
}

fn fetch_with(client: &Client, url: &str) -> Result<String> {
    let response = client
        .get(url)
        .send()
        .with_context(|| format!("GET {url}"))?
        .error_for_status()
        .with_context(|| format!("GET {url}"))?;
    read_capped(response).with_context(|| format!("read body of {url}"))
}

fn read_capped(reader: impl Read) -> std::io::Result<String> {
    let mut bytes = Vec::new();
    reader.take(MAX_INPUT_BYTES).read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    use anyhow::bail;

    /// Serve one HTTP response with `body`, returning the URL to fetch.
    fn serve_once(status: &'static str, body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let head = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(head.as_bytes());
            let _ = stream.write_all(&body);
        });
        format!("http://{addr}/issue")
    }

    fn local_client() -> Client {
        Client::builder()
            .timeout(URL_TIMEOUT)
            .no_proxy()
            .build()
            .expect("client")
    }

    #[test]
    fn classifies_references() {
        let unused = |_: &str| -> Result<String> { bail!("no fetch expected") };
        assert_eq!(read_input_with(None, unused).expect("none").kind, InputKind::None);
        assert_eq!(read_input_with(Some("  "), unused).expect("blank").kind, InputKind::None);

        let text = read_input_with(Some("stack trace: boom"), unused).expect("text");
        assert_eq!(text.kind, InputKind::Text);
        assert_eq!(text.content, "stack trace: boom");
        assert!(text.has_context());
    }

    #[test]
    fn url_input_carries_fetched_body() {
        let payload = read_input_with(Some("https://example.com/issue/1"), |url| {
            Ok(format!("body of {url}"))
        })
        .expect("url");
        assert_eq!(payload.kind, InputKind::Url);
        assert_eq!(payload.reference.as_deref(), Some("https://example.com/issue/1"));
        assert_eq!(payload.content, "body of https://example.com/issue/1");
    }

    #[test]
    fn failed_fetch_keeps_bare_reference() {
        let payload = read_input_with(Some("http://127.0.0.1:9/x"), |_| bail!("connection refused"))
            .expect("url");
        assert_eq!(payload.kind, InputKind::Url);
        assert!(payload.content.is_empty());
        assert!(payload.has_context());
    }

    #[test]
    fn fetch_reads_local_server() {
        let url = serve_once("200 OK", b"Traceback: add() returned -1".to_vec());
        let body = fetch_with(&local_client(), &url).expect("fetch");
        assert_eq!(body, "Traceback: add() returned -1");
    }

    #[test]
    fn fetch_truncates_and_decodes_lossily() {
        let mut body = vec![0xff];
        body.extend(std::iter::repeat_n(b'y', MAX_INPUT_BYTES as usize + 10));
        let url = serve_once("200 OK", body);
        let text = fetch_with(&local_client(), &url).expect("fetch");
        assert!(text.starts_with('\u{fffd}'));
        assert_eq!(text.chars().count(), MAX_INPUT_BYTES as usize);
    }

    #[test]
    fn fetch_rejects_error_status() {
        let url = serve_once("404 Not Found", b"missing".to_vec());
        assert!(fetch_with(&local_client(), &url).is_err());
    }

    #[test]
    fn file_input_is_truncated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("big.txt");
        std::fs::write(&path, "x".repeat(MAX_INPUT_BYTES as usize + 10)).expect("write");
        let payload = read_optional_input(path.to_str()).expect("file");
        assert_eq!(payload.kind, InputKind::File);
        assert_eq!(payload.content.len(), MAX_INPUT_BYTES as usize);
    }
}
