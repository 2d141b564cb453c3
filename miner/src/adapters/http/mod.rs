//! HTTP clients for services running outside this process

pub mod fetch_client;

pub use fetch_client::RemoteFetchService;
