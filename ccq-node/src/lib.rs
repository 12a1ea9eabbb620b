pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod ingress;
pub mod metrics;
pub mod pending;
pub mod permissions;
pub mod publisher;
pub mod validator;
