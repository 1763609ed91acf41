pub mod admin;
pub mod auth;
pub mod config;
pub mod health;
pub mod metrics;
pub mod notifications;
pub mod policies;
pub mod products;
pub mod profile;
pub mod stats;
pub mod webhooks;
