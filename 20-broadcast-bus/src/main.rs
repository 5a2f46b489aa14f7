use anyhow::{Context, Result};
use clap::Parser;
use tokio::{select, task};
use tracing::{info, warn};

use broadcast_bus::{
    Bus,
    cli::{Cli, Command, ServeArgs},
    client, listener,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            if let Err(err) = serve(args).await {
                warn!("bus exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = args.config();
    let listener = listener::bind(args.listen, config.listen_backlog)
        .with_context(|| format!("failed to listen on {}", args.listen))?;
    let handle = Bus::new(listener, config)?.start()?;
    info!("bus listening on {}", handle.local_addr());

    let stopper = handle.stopper();
    let mut workers = task::spawn_blocking(move || handle.wait());
    select! {
        outcome = &mut workers => {
            return outcome.context("bus workers panicked")?;
        }
        ctrl_c = tokio::signal::ctrl_c() => {
            if let Err(error) = ctrl_c {
                warn!(?error, "ctrl-c handler failed");
                return workers.await.context("bus workers panicked")?;
            }
        }
    }

    info!("shutting down");
    stopper.stop();
    workers.await.context("bus workers panicked")?
}
