// API gateway: the background context's outbound HTTP relay.

pub mod client;

pub use client::{ApiGateway, HttpError, HttpGateway};
