use anyhow::Result;
use clap::{Parser, Subcommand};
use flux_config::ConfigLoader;
use flux_core::ShutdownSignal;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "broker.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a bearer token signed with the configured secret
    IssueToken {
        #[arg(long)]
        subject: String,
        /// Role to grant; defaults to auth.required_role
        #[arg(long)]
        role: Vec<String>,
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = ConfigLoader::new(&args.config).load_broker()?;

    if let Some(Command::IssueToken {
        subject,
        role,
        hours,
    }) = args.command
    {
        // 签发令牌只需要密钥，不要求开启认证
        config.auth.enabled = true;
        let auth = flux_broker::build_auth(&config.auth)?
            .ok_or_else(|| anyhow::anyhow!("auth.secret is not configured"))?;
        let roles = if role.is_empty() {
            vec![config.auth.required_role.clone()]
        } else {
            role
        };
        let token = auth
            .as_ref()
            .clone()
            .with_expiration_hours(hours)
            .generate_token(&subject, roles)?;
        println!("{}", token);
        return Ok(());
    }

    flux_logging::init_logging(&config.logging)?;
    tracing::info!("Starting FLUX re-id broker with config: {}", args.config);

    if config.metrics.enabled {
        flux_broker::metrics::init_metrics(config.metrics.listen.parse()?)?;
    }

    let shutdown = ShutdownSignal::new();
    shutdown.listen_for_system_signals();

    let listener = TcpListener::bind(config.server.bind_addr()).await?;
    flux_broker::run(config, listener, shutdown).await
}
