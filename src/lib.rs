//! llama-launch: drive a local `llama-server` from Rust
//!
//! This library provides:
//! - A supervisor that launches `llama-server` in its own process group,
//!   waits for `/health`, relays its logs and shuts it down
//! - A chat-completion client with retries while the model is loading
//! - Prompt token counting
//! - GBNF multiple-choice grammars, optionally preceded by a thinking block
//!
//! # Example
//!
//! ```no_run
//! use llama_launch::{LlamaClient, RequestOptions, Result, ServerConfig, ServerHandle};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = ServerConfig::new("/models/qwen3-8b-q4.gguf", 4096, 99).with_port(8080);
//!     let mut server = ServerHandle::start(config).await?;
//!
//!     let client = LlamaClient::new(server.base_url());
//!     let answer = client
//!         .send("Give one fun llama fact.", &RequestOptions::default())
//!         .await?;
//!     println!("{}", answer);
//!
//!     server.terminate(std::time::Duration::from_secs(10)).await?;
//!     Ok(())
//! }
//! ```

pub mod binary;
pub mod client;
pub mod error;
pub mod grammar;
pub mod process;

// Re-export main types for library users
pub use binary::BinaryLocator;
pub use client::{ClientConfig, LlamaClient, RequestOptions, RetryPolicy};
pub use error::{Error, Result};
pub use grammar::{load_grammar, multiple_choice_grammar, strip_thinking};
pub use process::{with_server, ServerConfig, ServerHandle};
