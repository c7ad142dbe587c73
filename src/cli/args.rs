//! Command-line argument structures for the async-jip CLI tools.

use clap::{Parser, ValueEnum};
use std::time::Duration;

use crate::client::{Backoff, ClientBuilder, Retry};

/// Output format for CLI tools.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Indented tree of nodes, MIBs and variables.
    #[default]
    Human,
    /// JSON output for scripting.
    Json,
}

/// Backoff strategy for CLI argument parsing.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum BackoffStrategy {
    /// Resend as soon as a request times out.
    #[default]
    None,
    /// Fixed delay between each retry.
    Fixed,
    /// Exponential backoff: delay doubles after each attempt.
    Exponential,
}

/// Connection arguments shared across all CLI tools.
#[derive(Debug, Parser)]
pub struct CommonArgs {
    /// Border router IPv6 address, with optional port (default 1873).
    #[arg(value_name = "BORDER_ROUTER")]
    pub border_router: String,

    /// Reach the border router through an IPv4 tunnel gateway (host:port).
    #[arg(short = 'g', long = "gateway")]
    pub gateway: Option<String>,

    /// Response timeout in milliseconds.
    #[arg(short = 't', long = "timeout", default_value = "500")]
    pub timeout: u64,

    /// Retransmissions after the first send.
    #[arg(short = 'r', long = "retries", default_value = "2")]
    pub retries: u32,

    /// Backoff strategy between retries: none, fixed, or exponential.
    #[arg(long = "backoff", default_value = "none")]
    pub backoff: BackoffStrategy,

    /// Backoff delay in milliseconds (initial delay for exponential, fixed delay otherwise).
    #[arg(long = "backoff-delay", default_value = "200")]
    pub backoff_delay: u64,

    /// Maximum backoff delay in milliseconds (exponential only).
    #[arg(long = "backoff-max", default_value = "2000")]
    pub backoff_max: u64,

    /// Jitter factor for exponential backoff (0.0-1.0, e.g., 0.25 means +/-25%).
    #[arg(long = "backoff-jitter", default_value = "0.25")]
    pub backoff_jitter: f64,

    /// Rows requested per table page.
    #[arg(long = "page-size", default_value = "1")]
    pub page_size: u8,
}

impl CommonArgs {
    /// Build a Retry configuration from the CLI arguments.
    pub fn retry_config(&self) -> Retry {
        let backoff = match self.backoff {
            BackoffStrategy::None => Backoff::None,
            BackoffStrategy::Fixed => Backoff::Fixed {
                delay: Duration::from_millis(self.backoff_delay),
            },
            BackoffStrategy::Exponential => Backoff::Exponential {
                initial: Duration::from_millis(self.backoff_delay),
                max: Duration::from_millis(self.backoff_max),
                jitter: self.backoff_jitter.clamp(0.0, 1.0),
            },
        };
        Retry {
            max_attempts: self.retries,
            backoff,
        }
    }

    /// Client builder configured from the CLI arguments.
    pub fn client_builder(&self) -> ClientBuilder {
        ClientBuilder::new()
            .border_router(self.border_router.clone())
            .timeout(Duration::from_millis(self.timeout))
            .retry(self.retry_config())
            .table_page_size(self.page_size)
    }
}

/// Output control arguments.
#[derive(Debug, Parser)]
pub struct OutputArgs {
    /// Output format: human or json.
    #[arg(short = 'O', long = "output", default_value = "human")]
    pub format: OutputFormat,

    /// Enable debug logging (async_jip=debug).
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    /// Enable trace logging (async_jip=trace).
    #[arg(short = 'D', long = "trace")]
    pub trace: bool,
}

impl OutputArgs {
    /// Initialize tracing based on debug/trace flags. `RUST_LOG` wins when set.
    pub fn init_tracing(&self) {
        use tracing_subscriber::EnvFilter;

        let filter = if self.trace {
            "async_jip=trace"
        } else if self.debug {
            "async_jip=debug"
        } else {
            "async_jip=warn"
        };

        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
            )
            .with_writer(std::io::stderr)
            .try_init();
    }
}

/// Split a `Mib/Var` selector.
pub fn parse_var_selector(selector: &str) -> Result<(&str, &str), String> {
    match selector.split_once('/') {
        Some((mib, var)) if !mib.is_empty() && !var.is_empty() => Ok((mib, var)),
        _ => Err(format!("invalid variable '{}': expected Mib/Var", selector)),
    }
}
