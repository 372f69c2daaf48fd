//! Outer collaborators of a fetch: raw downloader, presentation sink and user notifier.

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

/// Bytes fetched straight from the source, bypassing name resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[async_trait]
pub trait Downloader: Send + Sync {
    /// None when the source could not be fetched.
    async fn fetch(&self, url: &str) -> Option<DownloadedObject>;
}

#[async_trait]
pub trait PresentationSink: Send + Sync {
    /// `content` is None when the obtained file could not be read.
    async fn display(&self, content: Option<&[u8]>, base_address: &str);
}

pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

pub struct HttpDownloader {
    http: reqwest::Client,
}

impl HttpDownloader {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn fetch(&self, url: &str) -> Option<DownloadedObject> {
        let url = if url.contains("://") {
            url.to_string()
        } else {
            format!("http://{url}")
        };
        let resp = match self.http.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(%url, error = %e, "download failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            warn!(%url, status = %resp.status(), "download rejected");
            return None;
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        match resp.bytes().await {
            Ok(bytes) => {
                debug!(%url, len = bytes.len(), %content_type, "downloaded");
                Some(DownloadedObject {
                    bytes: bytes.to_vec(),
                    content_type,
                })
            }
            Err(e) => {
                warn!(%url, error = %e, "download body unreadable");
                None
            }
        }
    }
}

/// Writes displayed content to stdout, preceded by a base-address line.
pub struct StdoutSink;

#[async_trait]
impl PresentationSink for StdoutSink {
    async fn display(&self, content: Option<&[u8]>, base_address: &str) {
        let Some(bytes) = content else {
            warn!(base_address, "content unreadable");
            return;
        };
        let mut out = std::io::stdout().lock();
        let written = writeln!(out, "<!-- base: {base_address} -->")
            .and_then(|_| out.write_all(bytes))
            .and_then(|_| out.flush());
        if let Err(e) = written {
            warn!(error = %e, "stdout write failed");
        }
    }
}

pub struct StderrNotifier;

impl Notifier for StderrNotifier {
    fn notify(&self, message: &str) {
        eprintln!("{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn download_keeps_mime_essence() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.html"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html; charset=utf-8")
                    .set_body_string("<html></html>"),
            )
            .mount(&server)
            .await;

        let d = HttpDownloader::new(Duration::from_secs(5)).unwrap();
        let obj = d.fetch(&format!("{}/index.html", server.uri())).await.unwrap();
        assert_eq!(obj.content_type, "text/html");
        assert_eq!(obj.bytes, b"<html></html>");
    }

    #[tokio::test]
    async fn download_without_scheme_and_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3]))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let d = HttpDownloader::new(Duration::from_secs(5)).unwrap();
        let host = server.address().to_string();
        let obj = d.fetch(&format!("{host}/page")).await.unwrap();
        assert_eq!(obj.bytes, [1, 2, 3]);
        assert!(d.fetch(&format!("{host}/missing")).await.is_none());
    }
}
