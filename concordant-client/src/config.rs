//! Client configuration.

use std::time::Duration;

/// Default port of the realtime websocket endpoint.
pub const DEFAULT_WEBSOCKET_PORT: u16 = 8999;

/// Connection settings for one session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Remote application namespace.
    pub database: String,
    /// Base URL of the service (e.g., "http://127.0.0.1:4000").
    pub service_address: String,
    /// Opaque credential passed through to the service.
    pub credential: String,
    /// Port of the realtime websocket endpoint.
    pub websocket_port: u16,
    /// Path of the realtime websocket endpoint.
    pub websocket_path: String,
    /// Retry behavior of the network adapter.
    pub retry: RetryPolicy,
    /// Wait before reconnecting a dropped realtime channel.
    pub reconnect_delay: Duration,
    /// Per-request timeout of the HTTP client.
    pub request_timeout: Duration,
    /// Try the worker transport before the websocket.
    pub use_service_worker: bool,
}

impl ClientConfig {
    pub fn new(database: impl Into<String>, service_address: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            service_address: service_address.into(),
            credential: String::new(),
            websocket_port: DEFAULT_WEBSOCKET_PORT,
            websocket_path: "/".to_string(),
            retry: RetryPolicy::default(),
            reconnect_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            use_service_worker: true,
        }
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = credential.into();
        self
    }

    pub fn with_websocket(mut self, port: u16, path: impl Into<String>) -> Self {
        self.websocket_port = port;
        self.websocket_path = path.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Skip worker registration and go straight to the websocket.
    pub fn without_service_worker(mut self) -> Self {
        self.use_service_worker = false;
        self
    }

    /// Websocket URL derived from the service address host.
    ///
    /// `http://host:4000/x` with port 8999 and path `/` gives `ws://host:8999/`.
    pub fn websocket_url(&self) -> String {
        let (scheme, rest) = match self.service_address.split_once("://") {
            Some(("https", rest)) => ("wss", rest),
            Some((_, rest)) => ("ws", rest),
            None => ("ws", self.service_address.as_str()),
        };
        let authority = rest.split('/').next().unwrap_or_default();
        let host = match authority.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => authority,
        };
        let path = if self.websocket_path.starts_with('/') {
            self.websocket_path.clone()
        } else {
            format!("/{}", self.websocket_path)
        };
        format!("{scheme}://{host}:{}{path}", self.websocket_port)
    }
}

/// Retry behavior of the network adapter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Fixed wait between push attempts.
    pub push_delay: Duration,
    /// Push attempt cap; `None` retries until delivered.
    pub push_max_attempts: Option<u32>,
    /// Fixed wait between fetch attempts.
    pub fetch_delay: Duration,
    /// Fetch attempts before giving up and leaving the cache stale.
    pub fetch_max_attempts: u32,
}

impl RetryPolicy {
    pub fn with_push_delay(mut self, delay: Duration) -> Self {
        self.push_delay = delay;
        self
    }

    pub fn with_push_max_attempts(mut self, attempts: u32) -> Self {
        self.push_max_attempts = Some(attempts);
        self
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    pub fn with_fetch_max_attempts(mut self, attempts: u32) -> Self {
        self.fetch_max_attempts = attempts.max(1);
        self
    }

    /// Short delays for tests against an in-process service.
    pub fn fast() -> Self {
        Self {
            push_delay: Duration::from_millis(10),
            push_max_attempts: None,
            fetch_delay: Duration::from_millis(10),
            fetch_max_attempts: 3,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            push_delay: Duration::from_secs(1),
            push_max_attempts: None,
            fetch_delay: Duration::from_secs(1),
            fetch_max_attempts: 3,
        }
    }
}
