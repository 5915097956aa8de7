use std::sync::OnceLock;
use std::time::Duration;

use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::fetch::RetryPolicy;
use crate::playlist::QualityThreshold;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// HTTP client options shared by playlist and segment requests.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Overall timeout for a single request (zero disables it)
    pub timeout: Duration,

    /// Time allowed to establish a connection
    pub connect_timeout: Duration,

    /// How long idle pooled connections are kept
    pub pool_idle_timeout: Duration,

    /// Maximum idle connections to keep per host
    pub pool_max_idle_per_host: usize,

    pub follow_redirects: bool,

    pub user_agent: String,

    /// Extra headers, merged over the defaults
    pub headers: HeaderMap,

    /// Query parameters appended to every request (signed CDN tokens and the like)
    pub params: Vec<(String, String)>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            pool_idle_timeout: Duration::from_secs(30),
            pool_max_idle_per_host: 10,
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HttpConfig::default_headers(),
            params: Vec::new(),
        }
    }
}

impl HttpConfig {
    pub fn default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate"),
        );

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        default_headers
    }

    /// Merge custom headers over the defaults; custom values win.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        for (name, value) in headers.iter() {
            self.headers.insert(name.clone(), value.clone());
        }
        self
    }

    pub fn build_client(&self) -> Result<Client> {
        install_rustls_provider();

        let mut builder = Client::builder()
            .user_agent(&self.user_agent)
            .default_headers(self.headers.clone())
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .pool_idle_timeout(self.pool_idle_timeout)
            .redirect(if self.follow_redirects {
                reqwest::redirect::Policy::limited(10)
            } else {
                reqwest::redirect::Policy::none()
            });

        if !self.timeout.is_zero() {
            builder = builder.timeout(self.timeout);
        }
        if !self.connect_timeout.is_zero() {
            builder = builder.connect_timeout(self.connect_timeout);
        }

        Ok(builder.build()?)
    }
}

fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Fetch scheduling options, as they appear in the job file's `fetch` block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FetchConfig {
    /// Number of concurrent segment workers.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Minimum gap between two requests started by the same worker.
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,

    /// Retries per segment after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    #[serde(default = "default_true")]
    pub retry_jitter: bool,

    /// Lowest acceptable rendition bandwidth in bit/s.
    #[serde(default)]
    pub min_bandwidth: u64,

    /// Lowest acceptable rendition height in pixels.
    #[serde(default)]
    pub min_height: Option<u64>,

    /// How many source items are assembled and extracted at once.
    #[serde(default = "default_item_parallelism")]
    pub item_parallelism: usize,
}

fn default_concurrency() -> usize {
    4
}

fn default_request_delay_ms() -> u64 {
    250
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_item_parallelism() -> usize {
    2
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            request_delay_ms: default_request_delay_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_jitter: true,
            min_bandwidth: 0,
            min_height: None,
            item_parallelism: default_item_parallelism(),
        }
    }
}

impl FetchConfig {
    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter: self.retry_jitter,
        }
    }

    pub fn quality_threshold(&self) -> QualityThreshold {
        QualityThreshold {
            min_bandwidth: self.min_bandwidth,
            min_height: self.min_height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_headers_take_precedence() {
        let mut custom = HeaderMap::new();
        custom.insert(reqwest::header::ACCEPT, HeaderValue::from_static("video/*"));
        custom.insert(
            reqwest::header::REFERER,
            HeaderValue::from_static("https://courses.example/"),
        );

        let config = HttpConfig::default().with_headers(custom);
        assert_eq!(config.headers[reqwest::header::ACCEPT], "video/*");
        assert_eq!(
            config.headers[reqwest::header::REFERER],
            "https://courses.example/"
        );
        assert!(config.headers.contains_key(reqwest::header::CONNECTION));
    }

    #[test]
    fn fetch_block_fills_missing_fields() {
        let config: FetchConfig =
            serde_json::from_str(r#"{ "concurrency": 8, "minBandwidth": 500000 }"#).unwrap();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.min_bandwidth, 500_000);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.request_delay(), Duration::from_millis(250));
        assert!(config.retry_jitter);
    }

    #[test]
    fn retry_policy_mirrors_fetch_block() {
        let config = FetchConfig {
            max_retries: 2,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 1_000,
            retry_jitter: false,
            ..Default::default()
        };
        let policy = config.retry_policy();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.base_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_secs(1));
        assert!(!policy.jitter);
    }
}
