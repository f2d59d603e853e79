//! Analyzer readiness polling

use crate::{Result, TopowatchError};
use async_trait::async_trait;
use base64::Engine;
use std::io::{self, Read};
use std::time::Duration;
use tracing::debug;

/// Minimal response of the REST collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// HTTP-style request primitive
#[async_trait]
pub trait RestClient: Send + Sync {
    async fn request(
        &self,
        method: &str,
        path: &str,
        headers: &[(String, String)],
        body: Option<&[u8]>,
    ) -> io::Result<RestResponse>;
}

/// Basic credentials sent with every request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    fn header_value(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        )
    }
}

/// Blocking `ureq` client driven from tokio's blocking pool
#[derive(Clone)]
pub struct HttpRestClient {
    base_url: String,
    auth: Option<BasicAuth>,
    agent: ureq::Agent,
}

impl HttpRestClient {
    pub fn new(base_url: impl Into<String>, auth: Option<BasicAuth>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            base_url: base_url.into(),
            auth,
            agent,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl RestClient for HttpRestClient {
    async fn request(
        &self,
        method: &str,
        path: &str,
        headers: &[(String, String)],
        body: Option<&[u8]>,
    ) -> io::Result<RestResponse> {
        let mut request = self
            .agent
            .request(method, &format!("{}{}", self.base_url, path));
        if let Some(auth) = &self.auth {
            request = request.set("Authorization", &auth.header_value());
        }
        for (name, value) in headers {
            request = request.set(name, value);
        }
        let body = body.map(<[u8]>::to_vec);

        tokio::task::spawn_blocking(move || {
            let sent = match body {
                Some(body) => request.send_bytes(&body),
                None => request.call(),
            };
            // Non-2xx statuses still carry a response worth reporting
            let response = match sent {
                Ok(response) | Err(ureq::Error::Status(_, response)) => response,
                Err(e) => {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        e.to_string(),
                    ))
                }
            };

            let status = response.status();
            let mut body = Vec::new();
            response.into_reader().read_to_end(&mut body)?;
            Ok(RestResponse { status, body })
        })
        .await
        .map_err(io::Error::other)?
    }
}

/// Spacing between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// Doubles after each failed attempt, capped at `max`
    Exponential { initial: Duration, max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` retries forever
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            backoff: Backoff::Fixed(delay),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial, max } => {
                let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(max)
            }
        }
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(10),
            backoff: Backoff::Exponential {
                initial: Duration::from_millis(100),
                max: Duration::from_secs(5),
            },
        }
    }
}

/// Readiness gate on the analyzer API root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessCheck {
    pub path: String,
    pub policy: RetryPolicy,
}

impl ReadinessCheck {
    pub fn new(path: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            path: path.into(),
            policy,
        }
    }

    /// Poll until one `GET` succeeds with a 2xx status. Returns the number
    /// of attempts made.
    pub async fn wait<C>(&self, client: &C) -> Result<u32>
    where
        C: RestClient + ?Sized,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match client.request("GET", &self.path, &[], None).await {
                Ok(response) if (200..300).contains(&response.status) => {
                    debug!("Analyzer ready after {} attempt(s)", attempt);
                    return Ok(attempt);
                }
                Ok(response) => format!("unexpected status {}", response.status),
                Err(e) => e.to_string(),
            };

            if self.policy.exhausted(attempt) {
                return Err(TopowatchError::ReadinessTimeout {
                    attempts: attempt,
                    last_error: error,
                });
            }

            let delay = self.policy.delay_after(attempt);
            debug!(
                "Analyzer not ready (attempt {}): {}, retrying in {:?}",
                attempt, error, delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}
