//! Media-scanner HTTP client. POST to kick a job off, GET to poll while it
//! reports `203 ... IN PROGRESS`, terminate on `202` (done) or anything else
//! (error).

use std::time::Duration;

use crate::error::{categorize_scanner_body, SyncError};
use crate::workflow::WorkResult;

const POLL_DELAY: Duration = Duration::from_secs(1);

/// `DeviceSettings.media_scanner` — host may be unset, in which case every
/// scanner operation is a no-op `Skipped`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct MediaScannerConfig {
    pub host: String,
    pub port: u16,
}

/// One of the four scanner side-effects a [`crate::workflow::WorkStep`] can
/// request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerOperation {
    Scan,
    Metadata,
    Preview,
    Thumbnail,
}

impl ScannerOperation {
    fn segment(self) -> &'static str {
        match self {
            ScannerOperation::Scan => "media/scanAsync",
            ScannerOperation::Metadata => "metadata/generateAsync",
            ScannerOperation::Preview => "preview/generateAsync",
            ScannerOperation::Thumbnail => "thumbnail/generateAsync",
        }
    }
}

/// Compute the scanner-facing file id for a given name. `doGenerateMetadata`
/// (which calls the `media/scanAsync` endpoint — see `worker.rs`) uses the
/// raw name with backslashes normalised to forward slashes and no
/// `media_path` prefix; every other operation prefixes with `media_path`
/// when the target storage declares one.
pub fn scanner_file_id(op: ScannerOperation, media_path: Option<&str>, name: &str) -> String {
    let normalized = name.replace('\\', "/");
    if op == ScannerOperation::Scan {
        return normalized;
    }
    match media_path {
        Some(prefix) if !prefix.is_empty() => format!("{}/{}", prefix.trim_end_matches('/'), normalized),
        _ => normalized,
    }
}

/// Thin wrapper around `reqwest::Client` plus the configured scanner
/// endpoint. `generate` is the single entry point every `do_generate_*`
/// worker branch calls.
pub struct ScannerClient {
    http: reqwest::Client,
    config: Option<MediaScannerConfig>,
}

impl ScannerClient {
    pub fn new(config: Option<MediaScannerConfig>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_some()
    }

    /// Issue the POST, then poll via GET until the body settles on a
    /// terminal status. Returns `Skipped` without any HTTP call when no
    /// scanner host is configured.
    pub async fn generate(&self, op: ScannerOperation, file_id: &str) -> Result<WorkResult, SyncError> {
        let Some(cfg) = &self.config else {
            return Ok(WorkResult::skipped());
        };

        let url = format!(
            "http://{}:{}/{}/{}",
            cfg.host,
            cfg.port,
            op.segment(),
            urlencoding::encode(file_id)
        );

        let body = self.post(&url).await?;
        self.poll_until_done(&url, body).await
    }

    async fn post(&self, url: &str) -> Result<String, SyncError> {
        let resp = self
            .http
            .post(url)
            .send()
            .await
            .map_err(|err| SyncError::retryable(format!("scanner POST {url} failed: {err}")))?;
        resp.text()
            .await
            .map_err(|err| SyncError::retryable(format!("scanner POST {url} body read failed: {err}")))
    }

    async fn get(&self, url: &str) -> Result<String, SyncError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| SyncError::retryable(format!("scanner GET {url} failed: {err}")))?;
        resp.text()
            .await
            .map_err(|err| SyncError::retryable(format!("scanner GET {url} body read failed: {err}")))
    }

    /// Response codes are never consulted, only the leading token of the
    /// plain-text body. `202` is done, `203` means poll again after a
    /// one-second delay, anything else (including `404`/`500`) is an error.
    async fn poll_until_done(&self, url: &str, mut body: String) -> Result<WorkResult, SyncError> {
        loop {
            let token = body.split_whitespace().next().unwrap_or("");
            match token {
                "202" => return Ok(WorkResult::done()),
                "203" => {
                    tokio::time::sleep(POLL_DELAY).await;
                    body = self.get(url).await?;
                }
                _ => {
                    log::warn!(
                        "scanner {url}: terminal status classified {:?}: {body}",
                        categorize_scanner_body(&body)
                    );
                    return Ok(WorkResult::error(body));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> MediaScannerConfig {
        let url = server.uri();
        let rest = url.trim_start_matches("http://");
        let (host, port) = rest.split_once(':').unwrap();
        MediaScannerConfig {
            host: host.to_string(),
            port: port.parse().unwrap(),
        }
    }

    #[test]
    fn scan_file_id_ignores_media_path_and_normalizes_slashes() {
        let id = scanner_file_id(ScannerOperation::Scan, Some("prefix"), r"a\b\c.mov");
        assert_eq!(id, "a/b/c.mov");
    }

    #[test]
    fn metadata_file_id_prefixes_media_path() {
        let id = scanner_file_id(ScannerOperation::Metadata, Some("library/"), "a.mov");
        assert_eq!(id, "library/a.mov");
    }

    #[test]
    fn thumbnail_file_id_prefixes_media_path() {
        let id = scanner_file_id(ScannerOperation::Thumbnail, Some("library/"), "a.mov");
        assert_eq!(id, "library/a.mov");
    }

    #[test]
    fn thumbnail_file_id_without_media_path_is_unprefixed() {
        let id = scanner_file_id(ScannerOperation::Thumbnail, None, "a.mov");
        assert_eq!(id, "a.mov");
    }

    #[tokio::test]
    async fn disabled_scanner_yields_skipped_without_http_calls() {
        let client = ScannerClient::new(None);
        let result = client.generate(ScannerOperation::Metadata, "a.mov").await.unwrap();
        assert_eq!(result.status, crate::workflow::WorkStepStatus::Skipped);
    }

    #[tokio::test]
    async fn immediate_202_is_done_in_one_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/metadata/generateAsync/a.mov"))
            .respond_with(ResponseTemplate::new(200).set_body_string("202 MEDIA INFO OK"))
            .expect(1)
            .mount(&server)
            .await;

        let client = ScannerClient::new(Some(config_for(&server)));
        let result = client.generate(ScannerOperation::Metadata, "a.mov").await.unwrap();
        assert_eq!(result.status, crate::workflow::WorkStepStatus::Done);
    }

    #[tokio::test]
    async fn in_progress_then_done_polls_via_get() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/metadata/generateAsync/a.mov"))
            .respond_with(ResponseTemplate::new(200).set_body_string("203 MEDIA INFO IN PROGRESS"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/metadata/generateAsync/a.mov"))
            .respond_with(ResponseTemplate::new(200).set_body_string("202 MEDIA INFO OK"))
            .expect(1)
            .mount(&server)
            .await;

        let client = ScannerClient::new(Some(config_for(&server)));
        let result = client.generate(ScannerOperation::Metadata, "a.mov").await.unwrap();
        assert_eq!(result.status, crate::workflow::WorkStepStatus::Done);
    }

    #[tokio::test]
    async fn server_error_body_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/metadata/generateAsync/a.mov"))
            .respond_with(ResponseTemplate::new(200).set_body_string("500 internal error"))
            .mount(&server)
            .await;

        let client = ScannerClient::new(Some(config_for(&server)));
        let result = client.generate(ScannerOperation::Metadata, "a.mov").await.unwrap();
        assert_eq!(result.status, crate::workflow::WorkStepStatus::Error);
        assert_eq!(result.messages, vec!["500 internal error".to_string()]);
    }
}
