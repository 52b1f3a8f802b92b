use std::future::Future;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::error::FetchError;

/// Response body of a fetch, consumed exactly once by the storage writer.
pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// Fetches remote content. No retries: retry is the user's call.
pub trait NetworkFetcher: Send + Sync + 'static {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<ByteStream, FetchError>> + Send;
}

/// Plain HTTP GET over reqwest. The body is treated as opaque bytes whatever
/// its declared content type.
#[derive(Clone, Default)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Total size of the remote resource, asked for with a one-byte range.
    /// Falls back to `Content-Length` when the server ignores the range.
    pub async fn probe_size(&self, url: &str) -> Result<Option<u64>, FetchError> {
        let resp = self
            .client
            .get(url)
            .header(RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(|e| classify(url, e))?;

        check_status(url, resp.status())?;

        let total = resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(content_range_total);

        Ok(total.or_else(|| resp.content_length()))
    }
}

impl NetworkFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<ByteStream, FetchError> {
        debug!(url, "Fetching");
        let resp = self.client.get(url).send().await.map_err(|e| classify(url, e))?;

        check_status(url, resp.status())?;

        let url = url.to_string();
        Ok(resp
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| classify(&url, e)))
            .boxed())
    }
}

fn check_status(url: &str, status: StatusCode) -> Result<(), FetchError> {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => Err(FetchError::NotFound { url: url.to_string() }),
        s if s.is_success() => Ok(()),
        s => Err(FetchError::Transport(format!("{} returned {}", url, s))),
    }
}

fn classify(url: &str, e: reqwest::Error) -> FetchError {
    if e.is_builder() || e.is_redirect() {
        return FetchError::Unclassified(anyhow::Error::new(e));
    }
    if e.is_connect() {
        return FetchError::HostUnreachable(format!("{}: {}", url, e));
    }
    if let Some(status) = e.status() {
        if let Err(classified) = check_status(url, status) {
            return classified;
        }
    }
    if e.is_timeout() || e.is_request() || e.is_body() || e.is_decode() {
        return FetchError::Transport(e.to_string());
    }
    FetchError::Unclassified(anyhow::Error::new(e))
}

/// `bytes 0-0/7168` -> 7168. An unknown total (`*`) yields None.
fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn collect(stream: ByteStream) -> Vec<u8> {
        stream
            .map(|chunk| chunk.unwrap())
            .collect::<Vec<_>>()
            .await
            .concat()
    }

    #[tokio::test]
    async fn fetch_streams_the_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "text/html")
                    .set_body_bytes(b"\x89PNG-bytes".to_vec()),
            )
            .mount(&server)
            .await;

        let stream = HttpFetcher::new()
            .fetch(&format!("{}/a.png", server.uri()))
            .await
            .unwrap();
        assert_eq!(collect(stream).await, b"\x89PNG-bytes");
    }

    #[tokio::test]
    async fn missing_resource_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = HttpFetcher::new()
            .fetch(&format!("{}/gone.pdf", server.uri()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, FetchError::NotFound { .. }));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn server_error_is_transport() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = HttpFetcher::new().fetch(&server.uri()).await.err().unwrap();
        assert!(matches!(err, FetchError::Transport(_)));
    }

    #[tokio::test]
    async fn refused_connection_is_host_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = HttpFetcher::new()
            .fetch(&format!("http://127.0.0.1:{}/a.png", port))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, FetchError::HostUnreachable(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn malformed_url_is_unclassified() {
        let err = HttpFetcher::new().fetch("not a url").await.err().unwrap();
        assert!(matches!(err, FetchError::Unclassified(_)));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn probe_reads_total_from_content_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("Range", "bytes=0-0"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 0-0/7168")
                    .set_body_bytes(vec![0u8]),
            )
            .mount(&server)
            .await;

        let size = HttpFetcher::new().probe_size(&server.uri()).await.unwrap();
        assert_eq!(size, Some(7168));
    }

    #[test]
    fn content_range_parsing() {
        assert_eq!(content_range_total("bytes 0-0/92160"), Some(92160));
        assert_eq!(content_range_total("bytes 0-0/*"), None);
        assert_eq!(content_range_total("garbage"), None);
    }
}
