//! zdapd - the zdap daemon

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use zdap::{Config, DockerEngine, Result, Server, Service, ZfsStorage};

#[derive(Parser)]
#[command(name = "zdapd")]
#[command(about = "Copy-on-write database cloning daemon")]
#[command(version)]
struct Cli {
    /// ZFS pool holding all zdap datasets
    #[arg(long, global = true, env = "ZFS_POOL", default_value = "zdap")]
    zfs_pool: String,

    /// Directory containing *.resource.yml descriptors and scripts
    #[arg(long, global = true, env = "CONFIG_DIR", default_value = "./resources")]
    config_dir: PathBuf,

    /// Address clients use to reach clones on this host
    #[arg(long, global = true, env = "NETWORK_ADDRESS", default_value = "localhost")]
    network_address: String,

    /// Port the HTTP API listens on and advertises
    #[arg(long, global = true, env = "API_PORT", default_value = "43210")]
    api_port: u16,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon: pools, cron and the HTTP API
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
    },
    /// Destroy every zdap container and dataset on this host
    Destroy,
    /// Run every base rebuild cron job now
    ExecCron,
    /// List zdap datasets
    List {
        /// What to list
        #[arg(value_enum, default_value_t = ListKind::All)]
        kind: ListKind,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ListKind {
    All,
    Bases,
    Snaps,
    Clones,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("zdap=info")),
        )
        .init();

    let cli = Cli::parse();

    let config = Config {
        zfs_pool: cli.zfs_pool.clone(),
        config_dir: cli.config_dir.clone(),
        network_address: cli.network_address.clone(),
        api_port: cli.api_port,
    };

    let storage = Arc::new(ZfsStorage::new(cli.zfs_pool.clone()));
    let engine = Arc::new(DockerEngine::new());
    let service = Service::new(config, storage, engine)?;

    match cli.command {
        Commands::Serve { host } => {
            for r in service.resources() {
                tracing::info!(resource = %r.name, pooled = r.clone_pool.active(), "loaded resource");
            }
            service.start();

            let addr: SocketAddr = format!("{}:{}", host, cli.api_port)
                .parse()
                .map_err(|e| zdap::Error::Config(format!("bad listen address: {e}")))?;
            let server = Server::new(service, addr);
            server.run().await?;
        }
        Commands::Destroy => {
            tracing::info!("destroying all zdap containers and datasets");
            service.destroy_all().await?;
            tracing::info!("done");
        }
        Commands::ExecCron => {
            service.exec_all_cronjobs().await;
        }
        Commands::List { kind } => {
            let tree = service.storage().open().await?;
            let mut names: Vec<String> = match kind {
                ListKind::All => tree.names(),
                ListKind::Bases => tree.list_bases().iter().map(|d| d.name.clone()).collect(),
                ListKind::Snaps => tree.list_snaps().iter().map(|d| d.name.clone()).collect(),
                ListKind::Clones => tree.list_clones().iter().map(|d| d.name.clone()).collect(),
            };
            names.sort();
            for name in names {
                println!("{name}");
            }
        }
    }

    Ok(())
}
