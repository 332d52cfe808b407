//! HTTP responder for the backend's `/chat` endpoint.

use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use crate::core::config::ResponderConfig;

use super::transport::{
    DispatchFuture, DispatchRequest, Responder, ResponderError, ResponderReply, ResponderResult,
};

/// Notice used whenever the reply body cannot be used as-is.
const INVALID_REPLY: &str = "Invalid response format from server";

/// Responder that posts to `{base_url}/chat`.
#[derive(Debug, Clone)]
pub struct HttpResponder {
    client: Client,
    endpoint: Url,
}

impl HttpResponder {
    /// Build a responder from configuration.
    ///
    /// # Errors
    /// Returns [`ResponderError::Config`] when the base URL is missing or
    /// malformed, or when the HTTP client cannot be built.
    pub fn new(config: &ResponderConfig) -> ResponderResult<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| ResponderError::Config("responder.base_url is not set".to_string()))?;
        let endpoint = Url::parse(&format!("{}/chat", base_url.trim_end_matches('/')))
            .map_err(|err| ResponderError::Config(err.to_string()))?;
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| ResponderError::Config(err.to_string()))?;
        Ok(Self { client, endpoint })
    }

    #[cfg(test)]
    fn endpoint_str(&self) -> &str {
        self.endpoint.as_str()
    }
}

impl Responder for HttpResponder {
    fn dispatch(
        &self,
        request: DispatchRequest,
    ) -> DispatchFuture<'_, ResponderResult<ResponderReply>> {
        Box::pin(async move {
            debug!(thread = request.thread_id.as_deref(), "dispatching to backend");
            let response = self
                .client
                .post(self.endpoint.clone())
                .json(&request)
                .send()
                .await
                .map_err(classify)?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ResponderError::Remote {
                    status: status.as_u16(),
                    body,
                });
            }
            let reply: ResponderReply = match response.json().await {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(error = %err, "reply body did not decode");
                    return Err(ResponderError::InvalidReply(INVALID_REPLY.to_string()));
                }
            };
            if reply.response.trim().is_empty() {
                return Err(ResponderError::InvalidReply(INVALID_REPLY.to_string()));
            }
            Ok(reply)
        })
    }
}

/// Map transport failures onto the dispatch taxonomy.
fn classify(err: reqwest::Error) -> ResponderError {
    if err.is_timeout() {
        ResponderError::Timeout
    } else {
        ResponderError::Unreachable(err.to_string())
    }
}
