use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::token_error::is_token_invalid_error;
use super::transport::{ApiRequest, ApiResponse, HttpTransport, TransportError};
use crate::auth::{RefreshCoordinator, RefreshError, StoreError, TokenStore};

/// API error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    /// No response was received
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: Value },

    /// A 401 could not be recovered because the token refresh failed
    #[error("Session refresh failed: {0}")]
    Refresh(#[from] RefreshError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Token storage error: {0}")]
    Storage(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True when the server never answered
    pub fn is_network(&self) -> bool {
        matches!(self, ApiError::Transport(_))
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Storage(err.to_string())
    }
}

/// Authenticated API client.
///
/// Every request carries the stored access token. A 401 caused by an invalid token
/// triggers one refresh (shared with any refresh already in flight) and a single retry.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn HttpTransport>,
    store: TokenStore,
    coordinator: Arc<RefreshCoordinator>,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn HttpTransport>, coordinator: Arc<RefreshCoordinator>) -> Self {
        Self {
            transport,
            store: coordinator.store().clone(),
            coordinator,
        }
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    /// Make a GET request and deserialize the response
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.send(ApiRequest::get(path)).await?;
        decode_body(response)
    }

    /// Make a POST request with a JSON body
    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let response = self.send(ApiRequest::post(path).json(encode_body(body)?)).await?;
        decode_body(response)
    }

    /// Make a PUT request with a JSON body
    pub async fn put<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let response = self.send(ApiRequest::put(path).json(encode_body(body)?)).await?;
        decode_body(response)
    }

    /// Make a PATCH request with a JSON body
    pub async fn patch<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let response = self.send(ApiRequest::patch(path).json(encode_body(body)?)).await?;
        decode_body(response)
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.send(ApiRequest::delete(path)).await.map(|_| ())
    }

    /// Send a request through the authentication pipeline
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let request = self.authorize(request)?;

        let error = match self.dispatch(request.clone()).await {
            Ok(response) => return Ok(response),
            Err(error) => error,
        };

        if request.silent {
            return Err(error);
        }

        let token_rejected = matches!(
            &error,
            ApiError::Http { status: 401, body } if is_token_invalid_error(body)
        );

        if token_rejected && !request.retried {
            return self.recover(request).await;
        }

        Err(error)
    }

    fn authorize(&self, mut request: ApiRequest) -> Result<ApiRequest, ApiError> {
        if let Some(token) = self.store.access_token()? {
            request.set_bearer(&token);
        }
        Ok(request)
    }

    async fn dispatch(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let response = self.transport.send(request).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(ApiError::Http {
                status: response.status,
                body: response.body,
            })
        }
    }

    /// Refresh the access token and re-issue the request once
    async fn recover(&self, mut request: ApiRequest) -> Result<ApiResponse, ApiError> {
        request.retried = true;

        let token = match self.rotated_since(&request)? {
            Some(token) => {
                debug!("Token rotated while {} {} was in flight, retrying", request.method, request.path);
                token
            }
            None => {
                if self.coordinator.is_refreshing() {
                    debug!("Queueing {} {} behind in-flight refresh", request.method, request.path);
                } else {
                    debug!("Access token rejected for {} {}, refreshing", request.method, request.path);
                }

                self.coordinator.try_refresh().await.map_err(|e| {
                    warn!("Could not recover {} {}: {}", request.method, request.path, e);
                    ApiError::Refresh(e)
                })?
            }
        };

        request.set_bearer(&token);
        self.dispatch(request).await
    }

    /// Stored access token, if it replaced the one `request` was sent with
    fn rotated_since(&self, request: &ApiRequest) -> Result<Option<String>, ApiError> {
        if self.coordinator.is_refreshing() {
            return Ok(None);
        }

        let sent = request.header("Authorization");
        Ok(self
            .store
            .access_token()?
            .filter(|current| sent != Some(format!("Bearer {}", current).as_str())))
    }
}

fn encode_body<B: Serialize>(body: &B) -> Result<Value, ApiError> {
    serde_json::to_value(body).map_err(|e| ApiError::Serialization(e.to_string()))
}

fn decode_body<T: DeserializeOwned>(response: ApiResponse) -> Result<T, ApiError> {
    serde_json::from_value(response.body).map_err(|e| ApiError::Serialization(e.to_string()))
}
