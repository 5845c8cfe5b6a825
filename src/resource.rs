// resource.rs
use crate::types::{DownloadError, Result, TaskConfig};
use faststr::FastStr;
use log::{debug, info, warn};
use reqwest::header::{HeaderMap, HeaderName, CONTENT_LENGTH, ETAG, LAST_MODIFIED};
use reqwest::{Client, ClientBuilder, Url};

/// Name used when the URL path has no usable last segment.
const FALLBACK_FILE_NAME: &str = "download";

/// What the HEAD probe learned about a resource.
///
/// The validators let a saved download notice that the remote file changed
/// even when its size did not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeInfo {
    /// `None` when the length is unknown.
    pub length: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl ProbeInfo {
    /// Reads length and validators from a successful HEAD response.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            length: parse_content_length(headers),
            etag: header_string(headers, ETAG),
            last_modified: header_string(headers, LAST_MODIFIED),
        }
    }
}

/// A remote resource and the client used to reach it.
#[derive(Debug, Clone)]
pub struct Resource {
    /// Parsed form, used for name derivation
    url: Url,
    /// Original string as given by the caller
    raw: FastStr,
    client: Client,
}

impl Resource {
    /// Parses `url` and builds a client from `config`.
    pub fn new(url: impl Into<FastStr>, config: &TaskConfig) -> Result<Self> {
        let client = build_client(config)?;
        Self::with_client(url, client)
    }

    /// Uses a caller supplied client, e.g. with a proxy configured.
    pub fn with_client(url: impl Into<FastStr>, client: Client) -> Result<Self> {
        let raw: FastStr = url.into();
        let url = Url::parse(raw.as_str()).map_err(|source| DownloadError::InvalidUrl {
            url: raw.to_string(),
            source,
        })?;
        Ok(Self { url, raw, client })
    }

    pub fn url(&self) -> &FastStr {
        &self.raw
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Sends a HEAD request and returns the resource length and validators.
    ///
    /// A `None` length means it is unknown: the header was missing or
    /// malformed, or the server refused HEAD. Only a transport failure is an
    /// error.
    pub async fn probe(&self) -> Result<ProbeInfo> {
        info!("[Resource] Probing {}", self.raw);
        let resp = self
            .client
            .head(self.url.clone())
            .send()
            .await
            .map_err(DownloadError::Probe)?;

        if !resp.status().is_success() {
            warn!(
                "[Resource] HEAD answered {}, continuing with unknown size.",
                resp.status()
            );
            return Ok(ProbeInfo::default());
        }

        let info = ProbeInfo::from_headers(resp.headers());
        match info.length {
            Some(len) => debug!("[Resource] Content-Length: {len}"),
            None => warn!("[Resource] Missing or malformed Content-Length, size unknown."),
        }
        if let Some(etag) = &info.etag {
            debug!("[Resource] ETag: {etag}");
        }
        Ok(info)
    }

    /// File name taken from the last path segment of the URL.
    pub fn file_name(&self) -> String {
        file_name_from_url(&self.url)
    }
}

/// Builds the HTTP client shared by the probe and all fetchers.
pub fn build_client(config: &TaskConfig) -> Result<Client> {
    ClientBuilder::new()
        .user_agent(config.user_agent.as_str())
        .connect_timeout(config.connect_timeout)
        .build()
        .map_err(DownloadError::Client)
}

/// Reads `Content-Length` as a byte count.
pub fn parse_content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
}

fn header_string(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)?
        .to_str()
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Last path segment of `url`; query and fragment never take part.
pub fn file_name_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .unwrap_or(FALLBACK_FILE_NAME)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn name(url: &str) -> String {
        file_name_from_url(&Url::parse(url).unwrap())
    }

    #[test]
    fn test_file_name_from_path() {
        assert_eq!(name("https://example.com/files/archive.tar.gz"), "archive.tar.gz");
        assert_eq!(name("https://example.com/a/b/c.iso?token=abc&x=1"), "c.iso");
        assert_eq!(name("https://example.com/video.mp4#t=10"), "video.mp4");
    }

    #[test]
    fn test_file_name_fallback() {
        assert_eq!(name("https://example.com/"), FALLBACK_FILE_NAME);
        assert_eq!(name("https://example.com"), FALLBACK_FILE_NAME);
        assert_eq!(name("https://example.com/dir/"), FALLBACK_FILE_NAME);
    }

    #[test]
    fn test_content_length_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_content_length(&headers), None);

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("1024"));
        assert_eq!(parse_content_length(&headers), Some(1024));

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("ten"));
        assert_eq!(parse_content_length(&headers), None);

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("-1"));
        assert_eq!(parse_content_length(&headers), None);
    }

    #[test]
    fn test_probe_info_reads_validators() {
        let mut headers = HeaderMap::new();
        assert_eq!(ProbeInfo::from_headers(&headers), ProbeInfo::default());

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        headers.insert(ETAG, HeaderValue::from_static("\"abc\""));
        headers.insert(
            LAST_MODIFIED,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        let info = ProbeInfo::from_headers(&headers);
        assert_eq!(info.length, Some(42));
        assert_eq!(info.etag.as_deref(), Some("\"abc\""));
        assert_eq!(
            info.last_modified.as_deref(),
            Some("Wed, 21 Oct 2015 07:28:00 GMT")
        );
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let err = Resource::new("not a url", &TaskConfig::default()).unwrap_err();
        assert!(matches!(err, DownloadError::InvalidUrl { .. }));
    }
}
