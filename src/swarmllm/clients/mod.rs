//! Concrete [`ModelClient`](crate::client_wrapper::ModelClient)
//! implementations.
//!
//! The engine only depends on the trait; these modules exist so the crate
//! is usable out of the box against a local model server.

pub mod ollama;

pub use ollama::OllamaClient;
