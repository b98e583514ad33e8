// src/lib.rs

// Import the top-level `swarmllm` module.
pub mod swarmllm;

// Re-export the component modules at the crate root so embedders write
// swarmllm::engine::DelegationEngine rather than swarmllm::swarmllm::…
pub use swarmllm::aggregator;
pub use swarmllm::cancel;
pub use swarmllm::client_wrapper;
pub use swarmllm::clients;
pub use swarmllm::clock;
pub use swarmllm::config;
pub use swarmllm::engine;
pub use swarmllm::errors;
pub use swarmllm::executor;
pub use swarmllm::model_pool;
pub use swarmllm::parser;
pub use swarmllm::plan;
pub use swarmllm::planner;
pub use swarmllm::registry;
pub use swarmllm::scheduler;
pub use swarmllm::tool_backend;
pub use swarmllm::tools;
pub use swarmllm::trace;

// Key items for easier external access.
pub use swarmllm::cancel::CancelToken;
pub use swarmllm::client_wrapper::{Message, ModelClient, Role};
pub use swarmllm::engine::{DelegationEngine, RunOutput};
