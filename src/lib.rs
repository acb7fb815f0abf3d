//! Bevakning: background job engine for long-running extraction against a
//! single shared automation session.

pub mod api;
pub mod captcha;
pub mod clock;
pub mod config;
pub mod error;
pub mod jobs;
pub mod poller;
pub mod session;
pub mod store;
