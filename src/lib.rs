pub mod api;
pub mod config;
pub mod controller;
pub mod domain;
pub mod gateway;
pub mod ingest;
pub mod power_flow;
pub mod repo;
pub mod schema;
pub mod subscriptions;
pub mod telemetry;
