pub mod client;
pub mod token_error;
pub mod transport;

pub use client::{ApiClient, ApiError};
pub use token_error::is_token_invalid_error;
pub use transport::{ApiRequest, ApiResponse, HttpTransport, ReqwestTransport, TransportError};
