pub mod anthropic;
pub mod app;
pub mod auth;
pub mod chat;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod responses;
pub mod store;
pub mod tools;
pub mod upstream;
