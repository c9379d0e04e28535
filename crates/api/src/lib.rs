//! `courier-api` — HTTP surface of the mail dispatch service.

pub mod app;
pub mod context;
pub mod middleware;
