mod cli;

use clap::Parser;
use cli::{Cli, Command, Options};
use kestrel_comms::CommsOptions;
use kestrel_common::SubclusterConfig;
use kestrel_kernel::{Kernel, builtin};
use kestrel_storage::{InMemoryBackend, StorageBackend};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(opts: &Options) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(opts.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn open_backend(opts: &Options) -> eyre::Result<Arc<dyn StorageBackend>> {
    if opts.datadir.as_os_str() == "memory" {
        warn!("using the in-memory backend: state will not survive exit");
        return Ok(Arc::new(InMemoryBackend::new()));
    }
    #[cfg(feature = "rocksdb")]
    return Ok(Arc::new(kestrel_storage::RocksDbBackend::open(
        &opts.datadir,
    )?));
    #[cfg(not(feature = "rocksdb"))]
    eyre::bail!(
        "datadir `{}` needs the `rocksdb` build feature; use `--datadir memory` otherwise",
        opts.datadir.display()
    )
}

fn load_config(opts: &Options) -> eyre::Result<Option<SubclusterConfig>> {
    let Some(path) = &opts.config else {
        return Ok(None);
    };
    let text = std::fs::read_to_string(path)?;
    let mut config: SubclusterConfig = serde_json::from_str(&text)?;
    if opts.force_reset {
        config.force_reset = true;
    }
    Ok(Some(config))
}

async fn build_kernel(opts: &Options) -> eyre::Result<Kernel> {
    let backend = open_backend(opts)?;
    let mut kernel = Kernel::new(backend);
    builtin::register_builtin_bundles(&mut kernel);
    kernel.resume()?;
    if let Some(listen_addr) = opts.listen {
        kernel
            .init_remote_comms(CommsOptions {
                listen_addr,
                key_seed: opts.key_seed.as_ref().map(|seed| seed.clone().into_bytes()),
                known_peers: Vec::new(),
            })
            .await?;
    }
    Ok(kernel)
}

async fn run(opts: Options) -> eyre::Result<()> {
    let mut kernel = build_kernel(&opts).await?;

    if let Some(config) = load_config(&opts)? {
        let launch = kernel.launch_subcluster(config).await?;
        info!(
            subcluster = %launch.subcluster_id,
            result = %launch.bootstrap_result.body,
            "subcluster launched"
        );
    }

    info!("kernel running; ctrl-c to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            worked = kernel.step() => {
                if !worked? {
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                }
            }
        }
    }
    info!("shutting down");
    kernel.run_until_quiescent().await?;
    Ok(())
}

async fn status(opts: Options) -> eyre::Result<()> {
    let kernel = build_kernel(&opts).await?;
    let status = kernel.get_status()?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.opts);
    match cli.command {
        Some(Command::Status) => status(cli.opts).await,
        Some(Command::Run) | None => run(cli.opts).await,
    }
}
