//! Dialing side of tunnel registration
//!
//! Used by replicas linking to siblings, and by agents.

use std::sync::Arc;

use http::header::{CONNECTION, UPGRADE};
use http::{HeaderMap, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::error::TunnelError;
use crate::handler::SessionHandler;
use crate::reconnect::ExponentialBackoff;
use crate::server::UPGRADE_PROTOCOL;
use crate::session::{Role, Session, SessionConfig};

/// Opens tunnel sessions to one registration endpoint
pub struct TunnelClient {
    http: reqwest::Client,
    url: String,
    headers: HeaderMap,
    session_config: SessionConfig,
}

impl TunnelClient {
    /// Client for `url`, sending `headers` with every registration.
    ///
    /// `tls` replaces the default trust roots for https endpoints.
    pub fn new(
        url: impl Into<String>,
        headers: HeaderMap,
        tls: Option<rustls::ClientConfig>,
    ) -> Result<Self, TunnelError> {
        let mut builder = reqwest::Client::builder().http1_only().no_proxy();
        if let Some(tls) = tls {
            builder = builder.use_preconfigured_tls(tls);
        }
        Ok(Self {
            http: builder.build()?,
            url: url.into(),
            headers,
            session_config: SessionConfig::default(),
        })
    }

    /// Heartbeat settings of opened sessions
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Registration endpoint
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Perform one registration and start a session over the upgraded
    /// connection
    pub async fn connect(&self, handler: Arc<dyn SessionHandler>) -> Result<Arc<Session>, TunnelError> {
        let response = self
            .http
            .get(&self.url)
            .headers(self.headers.clone())
            .header(CONNECTION, "upgrade")
            .header(UPGRADE, UPGRADE_PROTOCOL)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::SWITCHING_PROTOCOLS {
            let body = response.text().await.unwrap_or_default();
            return Err(TunnelError::Refused {
                status: status.as_u16(),
                body,
            });
        }

        let upgraded = response.upgrade().await?;
        Ok(Session::spawn(
            upgraded,
            Role::Client,
            self.url.clone(),
            handler,
            self.session_config.clone(),
        ))
    }

    /// Keep a session to the endpoint up until `cancel` fires.
    ///
    /// `on_up` runs for each new session, `on_down` once it has closed.
    /// Failed attempts and lost sessions are retried after `backoff`.
    pub async fn run_link<U, D>(
        &self,
        handler: Arc<dyn SessionHandler>,
        mut backoff: ExponentialBackoff,
        cancel: CancellationToken,
        on_up: U,
        on_down: D,
    ) where
        U: Fn(&Arc<Session>),
        D: Fn(&Arc<Session>),
    {
        loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => break,
                attempt = self.connect(Arc::clone(&handler)) => attempt,
            };

            match attempt {
                Ok(session) => {
                    tracing::info!(url = %self.url, "Tunnel link established");
                    backoff.reset();
                    on_up(&session);
                    tokio::select! {
                        _ = cancel.cancelled() => session.close(),
                        _ = session.closed() => {}
                    }
                    on_down(&session);
                    if cancel.is_cancelled() {
                        break;
                    }
                    tracing::warn!(url = %self.url, "Tunnel link lost");
                }
                Err(e) => {
                    tracing::warn!(url = %self.url, "Tunnel link failed: {}", e);
                }
            }

            let delay = backoff.next_delay();
            tracing::debug!(url = %self.url, "Reconnecting in {:?}", delay);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tracing::debug!(url = %self.url, "Tunnel link stopped");
    }
}
