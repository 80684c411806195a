//! Basic example showing how to use llama-launch as a library
//!
//! Run with: cargo run --example basic_usage -- /path/to/model.gguf

use std::time::Duration;

use llama_launch::{
    multiple_choice_grammar, strip_thinking, with_server, LlamaClient, RequestOptions, Result,
    ServerConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing for logs
    tracing_subscriber::fmt::init();

    let model = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "models/qwen3-8b-q4.gguf".to_string());
    let config = ServerConfig::new(model, 4096, 99)
        .with_port(8080)
        .with_log_disable(true)
        .with_health_timeout(Duration::from_secs(120));

    with_server(config, |server| {
        Box::pin(async move {
            let client = LlamaClient::new(server.base_url());

            println!("=== Free-form answer ===");
            let answer = client
                .send("Give one fun llama fact.", &RequestOptions::default())
                .await?;
            println!("{}", answer);

            println!("\n=== Prompt tokens ===");
            println!("{}", client.num_tokens("Give one fun llama fact.").await?);

            println!("\n=== Constrained answer ===");
            let grammar = multiple_choice_grammar(
                &["Question", "Not question"],
                std::env::temp_dir(),
                "label",
                true,
            )?;
            let options = RequestOptions::default()
                .with_max_tokens(1024)
                .with_grammar(grammar);
            let raw = client
                .send("Is \"What time is the party?\" a question?", &options)
                .await?;
            println!("{}", strip_thinking(&raw));

            Ok(())
        })
    })
    .await
}
