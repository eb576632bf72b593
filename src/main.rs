#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use replybus::config::{self, Config};
use replybus::loopback::{self, LoopbackOptions};
use std::io::Write;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    #[value(name = "bash")]
    Bash,
    #[value(name = "fish")]
    Fish,
    #[value(name = "zsh")]
    Zsh,
    #[value(name = "powershell")]
    PowerShell,
    #[value(name = "elvish")]
    Elvish,
}

/// `replybus` - correlated request/reply over fire-and-forget pub/sub.
#[derive(Parser, Debug)]
#[command(name = "replybus")]
#[command(version)]
#[command(about = "Request/reply correlation over pub/sub transports.", long_about = None)]
struct Cli {
    /// Config file to use instead of `~/.replybus/config.toml`
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inspect the effective configuration
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },

    /// Run request/reply round-trips against an in-memory broker
    #[command(long_about = "\
Run request/reply round-trips against an in-memory broker.

A built-in responder answers every request on the `loopback` binding, \
so the whole correlation path (header chain, registry, handler, optional \
reply grouping) is exercised without an external transport.

Examples:
  replybus loopback
  replybus loopback --requests 1000 --replies 8
  REPLYBUS_GROUP_MAX_BYTES=256 replybus loopback --replies 32")]
    Loopback {
        /// Number of concurrent requests
        #[arg(long, default_value_t = 100)]
        requests: usize,

        /// Replies the responder sends per request
        #[arg(long, default_value_t = 1)]
        replies: usize,

        /// Per-request timeout in milliseconds (default: from config)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Generate shell completion script to stdout
    Completions {
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective configuration (file + env overrides) as TOML
    Show,
    /// Dump the full configuration JSON Schema to stdout
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(config_path) = &cli.config {
        if config_path.trim().is_empty() {
            bail!("--config cannot be empty");
        }
        std::env::set_var("REPLYBUS_CONFIG", config_path);
    }

    // Completions must remain stdout-only and should not load config or initialize logging.
    if let Commands::Completions { shell } = &cli.command {
        let mut stdout = std::io::stdout().lock();
        write_shell_completion(*shell, &mut stdout)?;
        return Ok(());
    }

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    match cli.command {
        Commands::Config { config_command } => match config_command {
            ConfigCommands::Show => {
                let config = Config::load_or_default().await?;
                print!("{}", config.to_toml()?);
                Ok(())
            }
            ConfigCommands::Schema => {
                let schema = schemars::schema_for!(config::Config);
                println!(
                    "{}",
                    serde_json::to_string_pretty(&schema)
                        .context("failed to serialize JSON Schema")?
                );
                Ok(())
            }
        },

        Commands::Loopback {
            requests,
            replies,
            timeout_ms,
        } => {
            if replies == 0 {
                bail!("--replies must be at least 1");
            }
            let config = Config::load_or_default().await?;
            info!(requests, replies, "starting loopback run");
            let report = loopback::run(
                &config,
                LoopbackOptions {
                    requests,
                    replies_per_request: replies,
                    timeout: timeout_ms.map(Duration::from_millis),
                },
            )
            .await?;

            println!("requests:  {}", report.requests);
            println!("succeeded: {}", report.succeeded);
            println!("failed:    {}", report.failed);
            println!("replies:   {}", report.replies_received);
            println!("p50:       {:.3} ms", report.p50_ms);
            println!("p99:       {:.3} ms", report.p99_ms);
            println!("max:       {:.3} ms", report.max_ms);
            println!("elapsed:   {:.3} ms", report.elapsed_ms);
            if report.failed > 0 {
                bail!("{} of {} requests failed", report.failed, report.requests);
            }
            Ok(())
        }

        Commands::Completions { .. } => Ok(()),
    }
}

fn write_shell_completion<W: Write>(shell: CompletionShell, writer: &mut W) -> Result<()> {
    use clap_complete::generate;
    use clap_complete::shells;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    match shell {
        CompletionShell::Bash => generate(shells::Bash, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Fish => generate(shells::Fish, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Zsh => generate(shells::Zsh, &mut cmd, bin_name.clone(), writer),
        CompletionShell::PowerShell => {
            generate(shells::PowerShell, &mut cmd, bin_name.clone(), writer);
        }
        CompletionShell::Elvish => generate(shells::Elvish, &mut cmd, bin_name, writer),
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn completion_script_names_the_binary() {
        let mut buffer = Vec::new();
        write_shell_completion(CompletionShell::Bash, &mut buffer).expect("completion");
        let script = String::from_utf8(buffer).expect("utf8");
        assert!(script.contains("replybus"));
    }

    #[test]
    fn loopback_flags_parse() {
        let cli = Cli::try_parse_from(["replybus", "loopback", "--requests", "5", "--replies", "3"])
            .expect("parse");
        match cli.command {
            Commands::Loopback {
                requests, replies, ..
            } => {
                assert_eq!(requests, 5);
                assert_eq!(replies, 3);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
