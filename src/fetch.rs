use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt as _;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use url::Url;

use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::retry::RetryPolicy;
use crate::validate::{BlockedAddress, UrlValidator};

#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub url: Url,
    pub final_url: Url,
    pub html: Vec<u8>,
    pub status_code: u16,
    pub fetched_at: DateTime<Utc>,
    pub content_length: usize,
    pub content_type: Option<String>,
}

impl FetchedDocument {
    pub fn html_lossy(&self) -> String {
        String::from_utf8_lossy(&self.html).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    pub timeout: Duration,
    pub max_bytes: u64,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_bytes: 5_000_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContentFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl ContentFetcher {
    /// Redirect targets are re-checked against `validator` (scheme, blocklist,
    /// IP literals), and hostnames are resolved through its connect guard, so
    /// neither a redirect nor a rebinding DNS answer reaches a private range.
    pub fn new(config: &FetchConfig, validator: UrlValidator) -> anyhow::Result<Self> {
        let guard = Arc::new(validator.connect_guard());
        let max_redirects = config.max_redirects;
        let redirect = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= max_redirects {
                return attempt.error(format!("more than {max_redirects} redirects"));
            }
            match validator.check_literal(attempt.url()) {
                Ok(()) => attempt.follow(),
                Err(reason) => attempt.error(format!("redirect target rejected: {reason}")),
            }
        });

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(redirect)
            .dns_resolver(guard)
            .connect_timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|err| anyhow::anyhow!("build fetch http client: {err}"))?;

        Ok(Self {
            client,
            retry: config.retry.policy(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn fetch(
        &self,
        url: &Url,
        options: &FetchOptions,
    ) -> Result<FetchedDocument, FetchError> {
        self.retry
            .run("fetch", FetchError::is_transient, |attempt| async move {
                tracing::debug!(%url, attempt, "fetch attempt");
                match tokio::time::timeout(options.timeout, self.fetch_once(url, options)).await {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::Timeout {
                        secs: options.timeout.as_secs().max(1),
                    }),
                }
            })
            .await
    }

    async fn fetch_once(
        &self,
        url: &Url,
        options: &FetchOptions,
    ) -> Result<FetchedDocument, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .header(ACCEPT, "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8")
            .send()
            .await
            .map_err(|err| classify_reqwest_error(&err, options))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }

        if let Some(declared) = response.content_length()
            && declared > options.max_bytes
        {
            return Err(FetchError::ContentTooLarge {
                limit: options.max_bytes,
            });
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned);

        let mut html = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| classify_reqwest_error(&err, options))?;
            if (html.len() + chunk.len()) as u64 > options.max_bytes {
                return Err(FetchError::ContentTooLarge {
                    limit: options.max_bytes,
                });
            }
            html.extend_from_slice(&chunk);
        }

        Ok(FetchedDocument {
            url: url.clone(),
            final_url,
            content_length: html.len(),
            html,
            status_code: status.as_u16(),
            fetched_at: Utc::now(),
            content_type,
        })
    }
}

fn classify_reqwest_error(err: &reqwest::Error, options: &FetchOptions) -> FetchError {
    if err.is_timeout() {
        return FetchError::Timeout {
            secs: options.timeout.as_secs().max(1),
        };
    }
    if let Some(blocked) = find_source::<BlockedAddress>(err) {
        return FetchError::Blocked(blocked.to_string());
    }
    if err.is_redirect() {
        return FetchError::Redirect(err.to_string());
    }
    FetchError::Network(err.to_string())
}

fn find_source<'a, T: std::error::Error + 'static>(
    err: &'a (dyn std::error::Error + 'static),
) -> Option<&'a T> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(found) = e.downcast_ref::<T>() {
            return Some(found);
        }
        current = e.source();
    }
    None
}
