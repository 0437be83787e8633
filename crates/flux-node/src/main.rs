use anyhow::{anyhow, Result};
use clap::Parser;
use flux_config::{ConfigLoader, NodeConfig};
use flux_core::{LinkConfig, ShutdownSignal};
use flux_node::{
    Collaborators, DirectorySource, HistogramReidentifier, IdentityTracker, NodeLink,
    NodeRuntime, NoopDetector, RuntimeOptions,
};
use flux_types::NodeMessage;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "node.toml")]
    config: String,
}

fn build_link(config: &NodeConfig) -> Result<NodeLink> {
    let mut link_config = LinkConfig::new(config.node.broker_url.clone())
        .with_retry(config.link.retry_delay(), config.link.connect_timeout())
        .with_replay_window(config.link.replay_window());
    if let Some(token) = &config.node.token {
        link_config = link_config.with_token(token.clone());
    }

    let link = match &config.node.id {
        Some(id) => NodeLink::with_hello(link_config, &NodeMessage::Identifier { id: id.clone() })?,
        None => NodeLink::new(link_config),
    };
    Ok(link)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ConfigLoader::new(&args.config).load_node()?;

    flux_logging::init_logging(&config.logging)?;
    tracing::info!("Starting FLUX re-id node with config: {}", args.config);

    let directory = config
        .source
        .directory
        .clone()
        .ok_or_else(|| anyhow!("source.directory is required"))?;
    let source = DirectorySource::open(&directory)?;

    let runtime = NodeRuntime::new(
        build_link(&config)?,
        Collaborators {
            detector: Box::new(NoopDetector),
            tracker: Box::new(IdentityTracker),
            reidentifier: Box::new(HistogramReidentifier::default()),
        },
        RuntimeOptions {
            buffer_capacity: config.buffer.capacity,
            match_threshold: config.reid.match_threshold,
        },
    );

    let shutdown = ShutdownSignal::new();
    shutdown.listen_for_system_signals();

    runtime
        .run(Box::new(source), config.source.frame_interval(), shutdown)
        .await
}
