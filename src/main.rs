use anyhow::{Context, Result};
use aws_audit_tools::commands;
use aws_audit_tools::commands::ip_lookup::{OutputFormat, ProviderSource};
use aws_audit_tools::commands::quotas::QuotaOptions;
use aws_audit_tools::ip_ranges::fetch::DEFAULT_FETCH_TIMEOUT;
use aws_audit_tools::parallel::executor::DEFAULT_MAX_WORKERS;
use aws_audit_tools::parallel::quotas::DEFAULT_WARNING_THRESHOLD;
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "aws-audit")]
#[command(about = "Parallel AWS account auditing tools", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check service quota health across regions
    ///
    /// Credentials come from the standard AWS provider chain (environment,
    /// shared config and credentials files, SSO, instance metadata).
    /// Regions default to AWS_REGION.
    Quotas {
        /// Service code (e.g., ec2, lambda, rds)
        #[arg(long)]
        service: String,

        /// Shared-config profiles (comma-separated); default credential chain when omitted
        #[arg(long, value_delimiter = ',')]
        profiles: Vec<String>,

        /// Regions to check (comma-separated)
        #[arg(long, value_delimiter = ',')]
        regions: Vec<String>,

        /// Usage percentage at which a quota counts as at risk
        #[arg(long, default_value_t = DEFAULT_WARNING_THRESHOLD)]
        threshold: f64,

        /// Only check the well-known quotas for the service
        #[arg(long, conflicts_with = "quota")]
        common: bool,

        /// Check a single quota by name (exact or substring match)
        #[arg(long)]
        quota: Option<String>,

        /// Maximum concurrent region checks
        #[arg(long, default_value_t = DEFAULT_MAX_WORKERS)]
        workers: usize,

        /// Output CSV file path
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Find which cloud provider ranges contain the given addresses
    IpLookup {
        /// Range document as PROVIDER=PATH (aws, gcp, azure, oracle, cloudflare, fastly)
        #[arg(long = "provider", required = true)]
        providers: Vec<ProviderSource>,

        /// IP addresses to look up
        #[arg(required = true)]
        ips: Vec<String>,

        /// Index backend: radix or array
        #[arg(long, default_value = "radix")]
        backend: String,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Download published IP range documents for ip-lookup
    FetchRanges {
        /// Providers to download (comma-separated); all when omitted
        #[arg(long, value_delimiter = ',')]
        providers: Vec<String>,

        /// Directory that receives <provider>.json
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,

        /// Per-request timeout in seconds
        #[arg(long, default_value_t = DEFAULT_FETCH_TIMEOUT.as_secs())]
        timeout: u64,
    },

    /// Generate shell completion scripts
    ///
    /// Examples:
    ///   aws-audit generate-completion bash \
    ///     > ~/.local/share/bash-completion/completions/aws-audit
    ///   aws-audit generate-completion zsh > ~/.zfunc/_aws-audit
    GenerateCompletion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn setup_logging(verbose: bool) {
    let default = if verbose {
        "aws_audit_tools=debug"
    } else {
        "aws_audit_tools=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .without_time()
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Quotas {
            service,
            profiles,
            regions,
            threshold,
            common,
            quota,
            workers,
            output,
        } => {
            let options = QuotaOptions {
                service,
                profiles,
                regions,
                threshold,
                common,
                quota,
                workers,
                output,
            };
            let runtime = tokio::runtime::Handle::current();
            // Collection blocks on worker threads that drive HTTP through the runtime handle
            tokio::task::spawn_blocking(move || commands::quotas::run(&options, runtime))
                .await
                .context("Quota check task panicked")?
        }
        Commands::IpLookup {
            providers,
            ips,
            backend,
            format,
        } => commands::ip_lookup::run(&providers, &ips, &backend, format),
        Commands::FetchRanges {
            providers,
            output_dir,
            timeout,
        } => {
            commands::fetch_ranges::run(&providers, &output_dir, Duration::from_secs(timeout))
                .await
        }
        Commands::GenerateCompletion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "aws-audit", &mut std::io::stdout());
            Ok(())
        }
    }
}
