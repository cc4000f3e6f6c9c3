use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;

use rumor_node::agent::Agent;
use rumor_node::api;
use rumor_node::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cfg.log_filter().parse().expect("static filter is valid")),
        )
        .init();

    let cfg = Arc::new(cfg.finalize()?);
    let agent = Agent::new(
        cfg.clone(),
        api::user_message_handler(&cfg),
        StdRng::from_entropy(),
    );
    tracing::info!(
        id = %hex::encode(agent.id().to_be_bytes()),
        addr = %cfg.addr,
        peers = cfg.peers.len(),
        "rumor agent starting"
    );

    {
        let agent = agent.clone();
        tokio::spawn(async move {
            if let Err(e) = agent.serve().await {
                tracing::error!(error = %e, "agent failed to serve");
                std::process::exit(1);
            }
        });
    }

    api::serve(agent, cfg).await
}
