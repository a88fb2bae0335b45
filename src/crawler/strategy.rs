//! Fetch strategies: the network operations the fetcher escalates through
//!
//! A strategy performs exactly one network attempt and reports the raw
//! response. Classification, retries and escalation live in
//! [`crate::crawler::fetcher`].

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::{header::CONTENT_TYPE, Client, Proxy};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

use crate::config::{FetchConfig, StrategyConfig};
use crate::crawler::headers::{build_browser_headers, random_user_agent};
use crate::utils::error::StrategyError;
use crate::utils::truncate_text;

/// Raw network response before classification
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    /// Header names are lowercase
    pub headers: BTreeMap<String, String>,
    pub content_type: String,
    pub body: Bytes,
    /// URL after redirects
    pub final_url: String,
}

/// One way of retrieving a URL
#[async_trait]
pub trait FetchStrategy: Send + Sync {
    /// Name used in logs, metrics and failure notes
    fn name(&self) -> &str;

    /// Perform a single network attempt
    async fn attempt(&self, url: &str) -> Result<RawResponse, StrategyError>;
}

/// Shared strategy handle
pub type SharedStrategy = Arc<dyn FetchStrategy>;

/// reqwest-based strategy, direct or through a proxy
pub struct HttpStrategy {
    name: String,
    client: Client,
    user_agent: Option<String>,
    max_body_bytes: usize,
}

impl HttpStrategy {
    /// Plain HTTP client
    pub fn direct(config: &FetchConfig) -> Result<Self, StrategyError> {
        Self::build("direct", config, None)
    }

    /// HTTP client routed through `proxy_url` (http, https or socks5)
    pub fn proxied(config: &FetchConfig, proxy_url: &str) -> Result<Self, StrategyError> {
        let proxy = Proxy::all(proxy_url)
            .map_err(|e| StrategyError::Config(format!("invalid proxy {proxy_url}: {e}")))?;
        Self::build("proxy", config, Some(proxy))
    }

    fn build(name: &str, config: &FetchConfig, proxy: Option<Proxy>) -> Result<Self, StrategyError> {
        let mut builder = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.request_timeout().min(Duration::from_secs(10)))
            .cookie_store(true)
            .gzip(true)
            .redirect(reqwest::redirect::Policy::limited(10));

        if let Some(proxy) = proxy {
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| StrategyError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            name: name.to_string(),
            client,
            user_agent: config.user_agent.clone(),
            max_body_bytes: config.max_body_bytes,
        })
    }
}

#[async_trait]
impl FetchStrategy for HttpStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn attempt(&self, url: &str) -> Result<RawResponse, StrategyError> {
        let user_agent = self.user_agent.as_deref().unwrap_or_else(|| random_user_agent());
        let mut response = self
            .client
            .get(url)
            .headers(build_browser_headers(user_agent, None))
            .send()
            .await?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if response
            .content_length()
            .is_some_and(|len| len as usize > self.max_body_bytes)
        {
            return Err(StrategyError::BodyTooLarge(self.max_body_bytes));
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(StrategyError::BodyTooLarge(self.max_body_bytes));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(RawResponse {
            status,
            headers,
            content_type,
            body: body.freeze(),
            final_url,
        })
    }
}

/// Headless browser run as an external command
///
/// The rendered document is read from stdout. `{url}` in the arguments is
/// replaced by the target; without a placeholder the URL is appended.
pub struct BrowserStrategy {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    max_body_bytes: usize,
}

impl BrowserStrategy {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
            max_body_bytes: FetchConfig::default().max_body_bytes,
        }
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    fn command_args(&self, url: &str) -> Vec<String> {
        let mut args: Vec<String> = self.args.iter().map(|a| a.replace("{url}", url)).collect();
        if !self.args.iter().any(|a| a.contains("{url}")) {
            args.push(url.to_string());
        }
        args
    }
}

#[async_trait]
impl FetchStrategy for BrowserStrategy {
    fn name(&self) -> &str {
        "browser"
    }

    async fn attempt(&self, url: &str) -> Result<RawResponse, StrategyError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.command_args(url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => result
                .map_err(|e| StrategyError::Browser(format!("failed to run {}: {e}", self.program)))?,
            Err(_) => return Err(StrategyError::Timeout(self.timeout)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StrategyError::Browser(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                truncate_text(stderr.trim(), 300)
            )));
        }

        if output.stdout.len() > self.max_body_bytes {
            return Err(StrategyError::BodyTooLarge(self.max_body_bytes));
        }

        Ok(RawResponse {
            status: 200,
            headers: BTreeMap::new(),
            content_type: "text/html".to_string(),
            body: Bytes::from(output.stdout),
            final_url: url.to_string(),
        })
    }
}

/// Build the configured strategy chain, in order
pub fn build_strategies(config: &FetchConfig) -> Result<Vec<SharedStrategy>, StrategyError> {
    config
        .strategies
        .iter()
        .map(|strategy| -> Result<SharedStrategy, StrategyError> {
            let built: SharedStrategy = match strategy {
                StrategyConfig::Direct => Arc::new(HttpStrategy::direct(config)?),
                StrategyConfig::Proxy { url } => Arc::new(HttpStrategy::proxied(config, url)?),
                StrategyConfig::Browser {
                    program,
                    args,
                    timeout_secs,
                } => {
                    let timeout = timeout_secs
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| config.request_timeout() * 2);
                    Arc::new(
                        BrowserStrategy::new(program.clone(), args.clone(), timeout)
                            .with_max_body_bytes(config.max_body_bytes),
                    )
                }
            };
            Ok(built)
        })
        .collect()
}
