//! Message handling and the service lifecycle

pub mod message_handler;
pub mod service;

pub use message_handler::DatabaseMessageHandler;
pub use service::{Service, ServiceSettings, ServiceState};
