pub mod config;
pub mod constants;
pub mod error;
pub mod gateway;
pub mod models;
pub mod session;
pub mod store;
pub mod tracing_setup;

pub use config::MessagingConfig;
pub use error::{GatewayError, GatewayResult, MessagingError};
pub use gateway::{Directory, MessageGateway};
pub use session::{SessionHandle, SessionRuntime, SessionSnapshot};
