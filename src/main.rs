use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use llama_launch::client::{DEFAULT_API_KEY, DEFAULT_BASE_URL, DEFAULT_MODEL};
use llama_launch::process::{DEFAULT_HOST, DEFAULT_PORT, DEFAULT_TERMINATE_TIMEOUT};
use llama_launch::{
    load_grammar, multiple_choice_grammar, strip_thinking, ClientConfig, LlamaClient,
    RequestOptions, RetryPolicy, ServerConfig, ServerHandle,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "llama-launch")]
#[command(about = "Launch a local llama-server and talk to its OpenAI-compatible API")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start llama-server, relay its logs and stop it on Ctrl-C
    Serve(ServeArgs),
    /// Send a prompt and print the reply
    Ask {
        prompt: String,
        /// System prompt sent before the user message
        #[arg(long)]
        system: Option<String>,
        #[arg(long)]
        max_tokens: Option<u32>,
        #[arg(long)]
        temperature: Option<f32>,
        /// GBNF grammar file constraining the reply
        #[arg(long)]
        grammar: Option<PathBuf>,
        /// Drop a leading <think> block from the reply
        #[arg(long)]
        strip_thinking: bool,
        #[command(flatten)]
        client: ClientArgs,
    },
    /// Print how many prompt tokens a prompt uses
    Tokens {
        prompt: String,
        #[command(flatten)]
        client: ClientArgs,
    },
    /// Write a multiple-choice grammar and print it
    Grammar {
        /// Rule name; also names the output file
        name: String,
        #[arg(required = true)]
        choices: Vec<String>,
        #[arg(long, default_value = ".")]
        dir: PathBuf,
        /// Do not require a thinking block before the answer
        #[arg(long)]
        no_thinking: bool,
    },
    /// Wait until the server's models endpoint answers
    Wait {
        #[arg(long, default_value = "60")]
        timeout: f64,
        #[command(flatten)]
        client: ClientArgs,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// Path to the GGUF model
    #[arg(short, long)]
    model: PathBuf,
    /// Context size
    #[arg(short = 'c', long)]
    ctx: u32,
    /// Layers to offload to the GPU
    #[arg(long)]
    gpu_layers: u32,
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u32,
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,
    #[arg(short, long)]
    threads: Option<u32>,
    #[arg(long)]
    http_threads: Option<u32>,
    #[arg(long)]
    slots: Option<u32>,
    #[arg(long)]
    cors: Option<String>,
    #[arg(long)]
    log_disable: bool,
    #[arg(long)]
    no_log_colors: bool,
    #[arg(short, long)]
    verbose: bool,
    #[arg(long)]
    api_key: Option<String>,
    /// Seconds to wait for /health
    #[arg(long, default_value = "30")]
    health_timeout: f64,
    /// Extra arguments passed to llama-server verbatim (after `--`)
    #[arg(last = true)]
    extra: Vec<String>,
}

impl ServeArgs {
    fn into_config(self) -> anyhow::Result<ServerConfig> {
        let health_timeout = Duration::try_from_secs_f64(self.health_timeout)
            .context("--health-timeout must be a non-negative number of seconds")?;
        let mut config = ServerConfig::new(self.model, self.ctx, self.gpu_layers)
            .with_port(self.port)
            .with_host(self.host)
            .with_log_disable(self.log_disable)
            .with_verbose(self.verbose)
            .with_health_timeout(health_timeout)
            .with_extra_args(self.extra);
        config.threads = self.threads;
        config.http_threads = self.http_threads;
        config.slots = self.slots;
        config.cors = self.cors;
        config.api_key = self.api_key;
        if self.no_log_colors {
            config = config.with_log_colors(false);
        }
        Ok(config)
    }
}

#[derive(Args)]
struct ClientArgs {
    #[arg(long, env = "LLAMA_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,
    #[arg(
        long = "key",
        env = "LLAMA_API_KEY",
        default_value = DEFAULT_API_KEY,
        hide_env_values = true
    )]
    api_key: String,
    #[arg(long = "model-name", default_value = DEFAULT_MODEL)]
    model: String,
    /// Attempts while the server reports the model is loading
    #[arg(long, default_value = "5")]
    attempts: u32,
}

impl ClientArgs {
    fn into_client(self) -> LlamaClient {
        LlamaClient::with_config(ClientConfig {
            base_url: self.base_url,
            api_key: self.api_key,
            model: self.model,
            retry: RetryPolicy {
                max_attempts: self.attempts,
                ..RetryPolicy::default()
            },
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => serve(args).await?,
        Commands::Ask {
            prompt,
            system,
            max_tokens,
            temperature,
            grammar,
            strip_thinking: strip,
            client,
        } => {
            let grammar = grammar
                .map(|path| {
                    load_grammar(&path)
                        .with_context(|| format!("Failed to read grammar {}", path.display()))
                })
                .transpose()?;
            let options = RequestOptions {
                system_prompt: system,
                max_tokens,
                temperature,
                grammar,
            };
            let answer = client
                .into_client()
                .send(&prompt, &options)
                .await
                .context("Chat completion failed")?;
            if strip {
                println!("{}", strip_thinking(&answer));
            } else {
                println!("{}", answer);
            }
        }
        Commands::Tokens { prompt, client } => {
            let count = client
                .into_client()
                .num_tokens(&prompt)
                .await
                .context("Token count failed")?;
            println!("{}", count);
        }
        Commands::Grammar {
            name,
            choices,
            dir,
            no_thinking,
        } => {
            let text = multiple_choice_grammar(choices.as_slice(), &dir, &name, !no_thinking)?;
            print!("{}", text);
        }
        Commands::Wait { timeout, client } => {
            let timeout = Duration::try_from_secs_f64(timeout)
                .context("--timeout must be a non-negative number of seconds")?;
            client.into_client().wait_until_ready(timeout).await?;
            tracing::info!("Server is ready");
        }
    }

    Ok(())
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = args.into_config()?;
    let mut server = ServerHandle::start(config)
        .await
        .context("Failed to start llama-server")?;

    tracing::info!(
        "OpenAI-compatible endpoint: {}/chat/completions",
        server.base_url()
    );

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            tracing::info!("Received Ctrl-C, shutting down");
        }
        status = server.wait() => {
            let status = status?;
            anyhow::bail!("llama-server exited unexpectedly ({})", status);
        }
    }

    server.terminate(DEFAULT_TERMINATE_TIMEOUT).await?;
    Ok(())
}
