//! HTTP implementation of the remote mirror.

use std::time::Duration;

use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE, ETAG, IF_NONE_MATCH, LOCATION};
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, info, warn};

use super::{
    parse_records, CreatedBin, EndpointPolicy, FetchOutcome, FreshnessToken, RemoteMirror,
    Snapshot,
};
use crate::config::RemoteConfig;
use crate::error::{Error, Result};
use crate::record::Record;

const JSON: &str = "application/json";
const JSON_PATCH: &str = "application/json-patch+json";

/// Remote mirror backed by a public JSON blob store over HTTP.
#[derive(Debug, Clone)]
pub struct HttpMirror {
    client: Client,
    policy: EndpointPolicy,
}

impl HttpMirror {
    /// Create a mirror with its own HTTP client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(policy: EndpointPolicy, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(client, policy))
    }

    /// Create a mirror from the remote section of the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint policy is invalid or the HTTP
    /// client cannot be built.
    pub fn from_config(config: &RemoteConfig) -> Result<Self> {
        let policy = EndpointPolicy::new(&config.create_url, &config.capability_prefix)?;
        Self::new(policy, Duration::from_secs(config.request_timeout_secs))
    }

    /// Create a mirror around an existing HTTP client.
    #[must_use]
    pub fn with_client(client: Client, policy: EndpointPolicy) -> Self {
        Self { client, policy }
    }
}

fn etag_of(headers: &HeaderMap) -> Option<FreshnessToken> {
    headers
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(FreshnessToken::new)
}

fn ensure_success(response: &Response, operation: &str) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        warn!("{} on {} failed with HTTP {}", operation, response.url(), status);
        Err(Error::RemoteStatus {
            status: status.as_u16(),
        })
    }
}

async fn read_snapshot(response: Response) -> Result<Snapshot> {
    let etag = etag_of(response.headers());
    let body = response.bytes().await?;
    let records = parse_records(&body)?;
    Ok(Snapshot { records, etag })
}

#[async_trait::async_trait]
impl RemoteMirror for HttpMirror {
    fn validate_endpoint(&self, url: &str) -> Result<()> {
        self.policy.validate(url)
    }

    async fn create_bin(&self, initial: &[Record]) -> Result<CreatedBin> {
        let response = self
            .client
            .post(self.policy.create_url())
            .header(CONTENT_TYPE, JSON)
            .header(ACCEPT, JSON)
            .body(serde_json::to_vec(initial)?)
            .send()
            .await?;
        ensure_success(&response, "create")?;

        let etag = etag_of(response.headers());
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|loc| response.url().join(loc).ok())
            .map(String::from);
        let url = match location {
            Some(url) => url,
            None => response.text().await?.trim().trim_matches('"').to_string(),
        };

        if !self.policy.is_capability(&url) {
            return Err(Error::parse(format!(
                "store returned an unusable endpoint '{url}'"
            )));
        }

        info!("Created shared dataset at {} with {} records", url, initial.len());
        Ok(CreatedBin { url, etag })
    }

    async fn fetch_all(&self, url: &str) -> Result<Snapshot> {
        self.policy.validate(url)?;

        let response = self.client.get(url).header(ACCEPT, JSON).send().await?;
        ensure_success(&response, "fetch")?;
        let snapshot = read_snapshot(response).await?;

        debug!("Fetched {} records from {}", snapshot.records.len(), url);
        Ok(snapshot)
    }

    async fn fetch_if_changed(
        &self,
        url: &str,
        token: Option<&FreshnessToken>,
    ) -> Result<FetchOutcome> {
        self.policy.validate(url)?;

        let mut request = self.client.get(url).header(ACCEPT, JSON);
        if let Some(token) = token {
            request = request.header(IF_NONE_MATCH, token.as_str());
        }
        let response = request.send().await?;

        if response.status() == StatusCode::NOT_MODIFIED {
            debug!("Shared dataset at {} unchanged", url);
            return Ok(FetchOutcome::Unchanged);
        }
        ensure_success(&response, "conditional fetch")?;

        let snapshot = read_snapshot(response).await?;
        debug!(
            "Shared dataset at {} changed ({} records)",
            url,
            snapshot.records.len()
        );
        Ok(FetchOutcome::Changed(snapshot))
    }

    async fn append_one(&self, url: &str, record: &Record) -> Result<Option<FreshnessToken>> {
        self.policy.validate(url)?;

        let patch = serde_json::json!([{ "op": "add", "path": "/-", "value": record }]);
        let response = self
            .client
            .patch(url)
            .header(CONTENT_TYPE, JSON_PATCH)
            .header(ACCEPT, JSON)
            .body(serde_json::to_vec(&patch)?)
            .send()
            .await?;
        ensure_success(&response, "append")?;

        debug!("Appended record {} to {}", record.id, url);
        Ok(etag_of(response.headers()))
    }

    async fn overwrite_all(&self, url: &str, records: &[Record]) -> Result<Option<FreshnessToken>> {
        self.policy.validate(url)?;

        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, JSON)
            .header(ACCEPT, JSON)
            .body(serde_json::to_vec(records)?)
            .send()
            .await?;
        ensure_success(&response, "overwrite")?;

        debug!("Overwrote {} with {} records", url, records.len());
        Ok(etag_of(response.headers()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::record::tests::record;

    #[derive(Debug, Clone)]
    struct Captured {
        method: String,
        path: String,
        headers: Vec<(String, String)>,
        body: String,
    }

    impl Captured {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }
    }

    fn response(status: &str, headers: &[(&str, &str)], body: &str) -> String {
        let mut out = format!("HTTP/1.1 {status}\r\n");
        for (name, value) in headers {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        out.push_str(&format!(
            "Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        ));
        out
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    async fn serve(responses: Vec<String>) -> (String, Arc<Mutex<Vec<Captured>>>) {
        serve_with(move |_| responses).await
    }

    /// Serve canned responses, one connection each, recording requests.
    /// The responses are built from the server's base URL.
    async fn serve_with<F>(responses: F) -> (String, Arc<Mutex<Vec<Captured>>>)
    where
        F: FnOnce(&str) -> Vec<String>,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let responses = responses(&base);
        let captured = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&captured);

        tokio::spawn(async move {
            for canned in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                let head_end = loop {
                    let n = stream.read(&mut chunk).await.unwrap();
                    assert!(n > 0, "client closed before sending headers");
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = find(&buf, b"\r\n\r\n") {
                        break pos + 4;
                    }
                };

                let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
                let mut lines = head.split("\r\n");
                let mut request_line = lines.next().unwrap().split(' ');
                let method = request_line.next().unwrap().to_string();
                let path = request_line.next().unwrap().to_string();
                let headers: Vec<(String, String)> = lines
                    .filter_map(|l| l.split_once(": "))
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect();
                let length = headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                    .map_or(0, |(_, v)| v.parse::<usize>().unwrap());
                while buf.len() < head_end + length {
                    let n = stream.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                let body = String::from_utf8_lossy(&buf[head_end..]).to_string();

                log.lock().unwrap().push(Captured {
                    method,
                    path,
                    headers,
                    body,
                });
                stream.write_all(canned.as_bytes()).await.unwrap();
                stream.shutdown().await.unwrap();
            }
        });

        (base, captured)
    }

    fn mirror(base: &str) -> HttpMirror {
        let policy = EndpointPolicy::new(
            format!("{base}/api/jsonBlob"),
            format!("{base}/api/jsonBlob/"),
        )
        .unwrap();
        let client = Client::builder().no_proxy().build().unwrap();
        HttpMirror::with_client(client, policy)
    }

    fn array_body(ids: &[(&str, &str)]) -> String {
        let records: Vec<Record> = ids.iter().map(|(id, at)| record(id, at)).collect();
        serde_json::to_string(&records).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_endpoint_makes_no_request() {
        let mirror = mirror("http://127.0.0.1:9");
        let r = record("a", "2024-01-01T10:00:00Z");

        for result in [
            mirror.fetch_all("https://evil.example/x").await.map(|_| ()),
            mirror
                .fetch_if_changed("https://evil.example/x", None)
                .await
                .map(|_| ()),
            mirror.append_one("https://evil.example/x", &r).await.map(|_| ()),
            mirror.overwrite_all("https://evil.example/x", &[]).await.map(|_| ()),
        ] {
            assert!(matches!(result, Err(Error::InvalidEndpoint { .. })));
        }
    }

    #[tokio::test]
    async fn test_create_bin_uses_location_header() {
        let (base, captured) = serve_with(|base| {
            let location = format!("{base}/api/jsonBlob/abc123");
            vec![response(
                "201 Created",
                &[("Location", &location), ("ETag", "\"v1\"")],
                "",
            )]
        })
        .await;
        let seed = vec![record("a", "2024-01-01T10:00:00Z")];

        let created = mirror(&base).create_bin(&seed).await.unwrap();

        assert_eq!(created.url, format!("{base}/api/jsonBlob/abc123"));
        assert_eq!(created.etag, Some(FreshnessToken::new("\"v1\"")));
        let requests = captured.lock().unwrap();
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].path, "/api/jsonBlob");
    }

    #[tokio::test]
    async fn test_create_bin_rejects_foreign_location() {
        let (base, _captured) = serve(vec![response(
            "201 Created",
            &[("Location", "https://evil.example/api/jsonBlob/abc123")],
            "",
        )])
        .await;

        let err = mirror(&base).create_bin(&[]).await.unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[tokio::test]
    async fn test_create_bin_relative_location() {
        let (base, captured) = serve(vec![response(
            "201 Created",
            &[("Location", "/api/jsonBlob/abc123"), ("ETag", "\"v1\"")],
            "",
        )])
        .await;
        let mirror = mirror(&base);
        let seed = vec![record("a", "2024-01-01T10:00:00Z")];

        let created = mirror.create_bin(&seed).await.unwrap();

        assert_eq!(created.url, format!("{base}/api/jsonBlob/abc123"));
        assert_eq!(created.etag, Some(FreshnessToken::new("\"v1\"")));
        let requests = captured.lock().unwrap();
        assert_eq!(requests[0].header("content-type"), Some(JSON));
        let sent: Vec<Record> = serde_json::from_str(&requests[0].body).unwrap();
        assert_eq!(sent, seed);
    }

    #[tokio::test]
    async fn test_create_bin_url_from_body() {
        let (base, _captured) = serve_with(|base| {
            let body = format!("\"{base}/api/jsonBlob/fromBody\"\n");
            vec![response("200 OK", &[], &body)]
        })
        .await;

        let created = mirror(&base).create_bin(&[]).await.unwrap();

        assert_eq!(created.url, format!("{base}/api/jsonBlob/fromBody"));
        assert!(created.etag.is_none());
    }

    #[tokio::test]
    async fn test_create_bin_failure_status() {
        let (base, _captured) = serve(vec![response("500 Internal Server Error", &[], "")]).await;
        let err = mirror(&base).create_bin(&[]).await.unwrap_err();
        assert!(matches!(err, Error::RemoteStatus { status: 500 }));
    }

    #[tokio::test]
    async fn test_fetch_all() {
        let body = array_body(&[("a", "2024-01-01T10:00:00Z"), ("b", "2024-02-01T10:00:00Z")]);
        let (base, captured) = serve(vec![response("200 OK", &[("ETag", "\"v7\"")], &body)]).await;
        let url = format!("{base}/api/jsonBlob/bin1");

        let snapshot = mirror(&base).fetch_all(&url).await.unwrap();

        assert_eq!(snapshot.records.len(), 2);
        assert_eq!(snapshot.etag, Some(FreshnessToken::new("\"v7\"")));
        let requests = captured.lock().unwrap();
        assert_eq!(requests[0].method, "GET");
        assert_eq!(requests[0].path, "/api/jsonBlob/bin1");
        assert!(requests[0].header("if-none-match").is_none());
    }

    #[tokio::test]
    async fn test_fetch_all_not_an_array() {
        let (base, _captured) = serve(vec![response("200 OK", &[], r#"{"records":[]}"#)]).await;
        let url = format!("{base}/api/jsonBlob/bin1");

        let err = mirror(&base).fetch_all(&url).await.unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[tokio::test]
    async fn test_fetch_all_error_status() {
        let (base, _captured) = serve(vec![response("404 Not Found", &[], "")]).await;
        let url = format!("{base}/api/jsonBlob/gone");

        let err = mirror(&base).fetch_all(&url).await.unwrap_err();
        assert!(matches!(err, Error::RemoteStatus { status: 404 }));
        assert!(err.is_remote_error());
    }

    #[tokio::test]
    async fn test_fetch_if_changed_unchanged() {
        let (base, captured) = serve(vec![response("304 Not Modified", &[("ETag", "\"v3\"")], "")]).await;
        let url = format!("{base}/api/jsonBlob/bin1");
        let token = FreshnessToken::new("\"v3\"");

        let outcome = mirror(&base)
            .fetch_if_changed(&url, Some(&token))
            .await
            .unwrap();

        assert_eq!(outcome, FetchOutcome::Unchanged);
        let requests = captured.lock().unwrap();
        assert_eq!(requests[0].header("if-none-match"), Some("\"v3\""));
    }

    #[tokio::test]
    async fn test_fetch_if_changed_changed() {
        let body = array_body(&[("a", "2024-01-01T10:00:00Z")]);
        let (base, _captured) = serve(vec![response("200 OK", &[("ETag", "\"v4\"")], &body)]).await;
        let url = format!("{base}/api/jsonBlob/bin1");

        let outcome = mirror(&base)
            .fetch_if_changed(&url, Some(&FreshnessToken::new("\"v3\"")))
            .await
            .unwrap();

        match outcome {
            FetchOutcome::Changed(snapshot) => {
                assert_eq!(snapshot.records[0].id, "a");
                assert_eq!(snapshot.etag, Some(FreshnessToken::new("\"v4\"")));
            }
            FetchOutcome::Unchanged => panic!("expected a changed snapshot"),
        }
    }

    #[tokio::test]
    async fn test_fetch_if_changed_error_status() {
        let (base, _captured) = serve(vec![response("503 Service Unavailable", &[], "")]).await;
        let url = format!("{base}/api/jsonBlob/bin1");

        let err = mirror(&base).fetch_if_changed(&url, None).await.unwrap_err();
        assert_eq!(err.remote_status(), Some(503));
    }

    #[tokio::test]
    async fn test_append_one_sends_json_patch() {
        let (base, captured) = serve(vec![response("200 OK", &[("ETag", "\"v9\"")], "[]")]).await;
        let url = format!("{base}/api/jsonBlob/bin1");
        let r = record("a", "2024-01-01T10:00:00Z");

        let token = mirror(&base).append_one(&url, &r).await.unwrap();

        assert_eq!(token, Some(FreshnessToken::new("\"v9\"")));
        let requests = captured.lock().unwrap();
        assert_eq!(requests[0].method, "PATCH");
        assert_eq!(requests[0].header("content-type"), Some(JSON_PATCH));
        let patch: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
        assert_eq!(patch[0]["op"], "add");
        assert_eq!(patch[0]["path"], "/-");
        assert_eq!(patch[0]["value"]["id"], "a");
    }

    #[tokio::test]
    async fn test_append_one_failure() {
        let (base, _captured) = serve(vec![response("429 Too Many Requests", &[], "")]).await;
        let url = format!("{base}/api/jsonBlob/bin1");

        let err = mirror(&base)
            .append_one(&url, &record("a", "2024-01-01T10:00:00Z"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RemoteStatus { status: 429 }));
    }

    #[tokio::test]
    async fn test_overwrite_all_posts_full_array() {
        let (base, captured) = serve(vec![
            response("200 OK", &[("ETag", "\"v2\"")], "[]"),
            response("200 OK", &[], "[]"),
        ])
        .await;
        let url = format!("{base}/api/jsonBlob/bin1");
        let mirror = mirror(&base);

        let token = mirror
            .overwrite_all(&url, &[record("a", "2024-01-01T10:00:00Z")])
            .await
            .unwrap();
        assert_eq!(token, Some(FreshnessToken::new("\"v2\"")));

        let token = mirror.overwrite_all(&url, &[]).await.unwrap();
        assert!(token.is_none());

        let requests = captured.lock().unwrap();
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].path, "/api/jsonBlob/bin1");
        let sent: Vec<Record> = serde_json::from_str(&requests[0].body).unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(requests[1].body, "[]");
    }

    #[tokio::test]
    async fn test_transport_failure_is_remote_error() {
        // Nothing listens on the discard port.
        let base = "http://127.0.0.1:9";
        let url = format!("{base}/api/jsonBlob/bin1");

        let err = mirror(base).fetch_all(&url).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(err.is_remote_error());
    }

    #[tokio::test]
    async fn test_from_config_enforces_prefix() {
        let config = RemoteConfig::default();
        let mirror = HttpMirror::from_config(&config).unwrap();

        let err = mirror
            .fetch_all("https://elsewhere.test/api/jsonBlob/1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidEndpoint { .. }));
    }
}
