//! Mimir - corporate LLM gateway with a content-addressed embedding cache
//!
//! This crate mediates LLM and embedding requests between application code
//! and a Bedrock-style foundation-model provider, behind one stable
//! request/response contract. It routes embedding work across a
//! persistent cache, local models, and the remote provider; collapses
//! identical in-flight work to one upstream call; breaks circuits around
//! unhealthy dependencies; and audits every outward call.
//!
//! # Generation Example
//!
//! ```rust,no_run
//! use mimir::{GenerateRequest, Mimir};
//!
//! #[tokio::main]
//! async fn main() -> mimir::Result<()> {
//!     let gateway = Mimir::builder().build().await?;
//!
//!     let response = gateway
//!         .generate(
//!             GenerateRequest::new("What is the capital of France?",
//!                                  "anthropic.claude-3-haiku-20240307-v1:0")
//!                 .max_tokens(256)
//!                 .user("analyst-7"),
//!         )
//!         .await;
//!
//!     println!("{}", response.content);
//!     Ok(())
//! }
//! ```
//!
//! # Embedding Example
//!
//! ```rust,no_run
//! use mimir::{EmbedRequest, Mimir};
//!
//! #[tokio::main]
//! async fn main() -> mimir::Result<()> {
//!     let gateway = Mimir::builder().build().await?;
//!
//!     let result = gateway.embed(EmbedRequest::new("hello world")).await?;
//!     println!("{} dims from {:?}", result.vector.len(), result.source);
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod breaker;
pub mod config;
pub mod deadline;
pub mod error;
pub mod flight;
pub mod gateway;
pub mod invoker;
pub mod local;
pub mod object_store;
pub mod router;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod types;

// Re-export main types at crate root
pub use breaker::{BreakerState, CircuitBreaker, RetryPolicy};
pub use config::{Config, ModelCatalog, ModelFamily, ModelSpec};
pub use error::{ErrorKind, MimirError, Result};
pub use gateway::{Gateway, GatewayBuilder, Mimir};

// Re-export the data model
pub use types::{
    AuditRecord, BreakerHealth, CachedEmbedding, DependencyHealth, EmbedRequest, EmbedResult,
    EmbeddingSource, GenerateRequest, GenerateResponse, HealthReport, InvokeOptions,
    ModelPerformance, TokenUsage,
};
