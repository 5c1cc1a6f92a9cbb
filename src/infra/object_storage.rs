//! HTTP object storage adapter: one authenticated PUT per object.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::{Client, StatusCode};
use tracing::debug;
use url::Url;

use crate::application::storage::{ObjectStorageClient, StorageError};
use crate::config::StorageSettings;
use crate::domain::types::UploadErrorKind;

use super::error::InfraError;

const SOURCE: &str = "infra::object_storage";

/// Unreserved characters stay literal inside a path segment.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Clone, Debug)]
pub struct HttpObjectStorage {
    client: Client,
    endpoint: Option<Url>,
    public_base: Option<Url>,
    token: Option<String>,
}

impl HttpObjectStorage {
    pub fn new(settings: &StorageSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .build()
            .map_err(|err| InfraError::http(format!("failed to build http client: {err}")))?;
        let endpoint = settings.endpoint.clone().map(with_trailing_slash);
        let public_base = settings
            .public_base_url
            .clone()
            .map(with_trailing_slash)
            .or_else(|| endpoint.clone());
        Ok(Self {
            client,
            endpoint,
            public_base,
            token: settings.token.clone(),
        })
    }

    pub fn user_agent() -> &'static str {
        concat!("offsite/", env!("CARGO_PKG_VERSION"))
    }

    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some()
    }
}

#[async_trait]
impl ObjectStorageClient for HttpObjectStorage {
    async fn upload(
        &self,
        local_path: &Path,
        remote_name: &str,
        timeout: Duration,
    ) -> Result<String, StorageError> {
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or_else(|| StorageError::fatal("storage endpoint is not configured"))?;
        let relative = encode_remote_name(remote_name)?;
        let target = endpoint
            .join(&relative)
            .map_err(|err| StorageError::fatal(format!("invalid object url: {err}")))?;

        let body = tokio::fs::read(local_path).await.map_err(|err| {
            let kind = if err.kind() == std::io::ErrorKind::NotFound {
                UploadErrorKind::Fatal
            } else {
                UploadErrorKind::Transient
            };
            StorageError::new(
                kind,
                format!("failed to read {}: {err}", local_path.display()),
            )
        })?;

        debug!(
            target = SOURCE,
            url = %target,
            size_bytes = body.len(),
            "uploading object"
        );

        let mut request = self.client.put(target.clone()).timeout(timeout).body(body);
        if let Some(token) = self.token.as_deref() {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| classify_transport(&err, timeout))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StorageError::new(
                classify_status(status),
                format!("status {status} body {}", truncate(&text, 200)),
            ));
        }

        let public = match self.public_base.as_ref() {
            Some(base) => base
                .join(&relative)
                .map_err(|err| StorageError::fatal(format!("invalid public url: {err}")))?,
            None => target,
        };
        Ok(public.to_string())
    }
}

/// Map an upload response status onto the retry taxonomy.
pub fn classify_status(status: StatusCode) -> UploadErrorKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => UploadErrorKind::Auth,
        StatusCode::PAYLOAD_TOO_LARGE => UploadErrorKind::SizeLimit,
        StatusCode::TOO_MANY_REQUESTS => UploadErrorKind::RateLimit,
        StatusCode::REQUEST_TIMEOUT => UploadErrorKind::Timeout,
        s if s.is_server_error() => UploadErrorKind::Transient,
        _ => UploadErrorKind::Fatal,
    }
}

fn classify_transport(err: &reqwest::Error, timeout: Duration) -> StorageError {
    if err.is_timeout() {
        return StorageError::timeout(timeout);
    }
    if is_certificate_failure(err) {
        return StorageError::new(UploadErrorKind::Auth, err.to_string());
    }
    if err.is_connect() || err.is_request() || err.is_body() {
        return StorageError::new(UploadErrorKind::Transient, err.to_string());
    }
    StorageError::fatal(err.to_string())
}

/// TLS trust failures surface as connect errors; retrying cannot fix them.
fn is_certificate_failure(err: &(dyn std::error::Error + 'static)) -> bool {
    const MARKERS: [&str; 4] = ["certificate", "unknownissuer", "handshake", "tls"];
    let mut current = Some(err);
    while let Some(error) = current {
        let message = error.to_string().to_lowercase();
        if MARKERS.iter().any(|marker| message.contains(marker)) {
            return true;
        }
        current = error.source();
    }
    false
}

fn encode_remote_name(remote_name: &str) -> Result<String, StorageError> {
    let trimmed = remote_name.trim_start_matches('/');
    let mut encoded = Vec::new();
    for segment in trimmed.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(StorageError::fatal(format!(
                "remote name `{remote_name}` has an empty or relative segment"
            )));
        }
        encoded.push(utf8_percent_encode(segment, SEGMENT).to_string());
    }
    Ok(encoded.join("/"))
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_to_error_kinds() {
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), UploadErrorKind::Auth);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), UploadErrorKind::Auth);
        assert_eq!(
            classify_status(StatusCode::PAYLOAD_TOO_LARGE),
            UploadErrorKind::SizeLimit
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            UploadErrorKind::RateLimit
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            UploadErrorKind::Transient
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            UploadErrorKind::Transient
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), UploadErrorKind::Fatal);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), UploadErrorKind::Fatal);
    }

    #[derive(Debug)]
    struct SendFailure(std::io::Error);

    impl std::fmt::Display for SendFailure {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("error sending request")
        }
    }

    impl std::error::Error for SendFailure {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn certificate_failures_are_found_in_the_source_chain() {
        let untrusted = SendFailure(std::io::Error::other(
            "invalid peer certificate: UnknownIssuer",
        ));
        assert!(is_certificate_failure(&untrusted));

        let refused = SendFailure(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert!(!is_certificate_failure(&refused));
    }

    #[test]
    fn remote_names_are_encoded_per_segment() {
        assert_eq!(
            encode_remote_name("/2024/05/my photo.jpg").expect("encode"),
            "2024/05/my%20photo.jpg"
        );
        assert!(encode_remote_name("a/../b").is_err());
        assert!(encode_remote_name("a//b").is_err());
        assert!(encode_remote_name("").is_err());
    }

    #[test]
    fn public_url_defaults_to_endpoint() {
        let settings = StorageSettings {
            endpoint: Some(Url::parse("https://bucket.example.com/media").expect("url")),
            token: None,
            public_base_url: None,
        };
        let storage = HttpObjectStorage::new(&settings).expect("client");
        let base = storage.public_base.as_ref().expect("public base");
        assert_eq!(base.as_str(), "https://bucket.example.com/media/");
        assert_eq!(
            base.join("a/b.png").expect("join").as_str(),
            "https://bucket.example.com/media/a/b.png"
        );
    }

    #[tokio::test]
    async fn missing_endpoint_is_fatal() {
        let storage = HttpObjectStorage::new(&StorageSettings {
            endpoint: None,
            token: None,
            public_base_url: None,
        })
        .expect("client");
        assert!(!storage.is_configured());
        let err = storage
            .upload(Path::new("/tmp/nothing"), "x.png", Duration::from_secs(1))
            .await
            .expect_err("unconfigured upload");
        assert_eq!(err.kind(), UploadErrorKind::Fatal);
    }
}
