use std::sync::Arc;

use anyhow::{Context, Result};

use crate::broker::Service;
use crate::cli::args::{KeygenArgs, StartArgs};
use crate::cluster::Cluster;
use crate::core::config::Config;
use crate::core::ids::{ClientId, SystemHashes};
use crate::core::time::{Clock, SystemClock};
use crate::messaging::topic::Topic;
use crate::net::security::{Access, KeyCodec};
use crate::net::Listener;
use crate::ops::telemetry;

/// Boot the broker and run until interrupted.
pub async fn run_start(args: StartArgs) -> Result<()> {
    let cfg = Config::load(&args.config)?;
    telemetry::init(&cfg.telemetry.log_level);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let service = Service::new(&cfg, clock)?;

    if let Some(cluster_cfg) = &cfg.cluster {
        let cluster = Cluster::new(cluster_cfg);
        cluster.bind(&service);
        service.attach_cluster(Arc::clone(&cluster));
        cluster.start().await.context("start cluster overlay")?;
    }

    Listener::start(Arc::clone(&service), &cfg.listener)
        .await
        .context("start listener")?;

    tokio::signal::ctrl_c().await.context("wait for shutdown")?;
    tracing::info!("shutting down");
    Ok(())
}

/// Operator tool: issue a key offline and dump the system hash table.
pub fn run_keygen(args: KeygenArgs) -> Result<()> {
    let cfg = Config::load(&args.config)?;
    let salt = cfg.security.hash_salt;
    let codec = KeyCodec::new(cfg.master_key()?, salt);
    let topic = Topic::parse(&args.topic, salt).context("parse topic")?;

    let hashes = SystemHashes::new(salt);
    println!("keygen:   {}", hashes.keygen);
    println!("clientid: {}", hashes.clientid);
    println!("presence: {}", hashes.presence);
    println!("...:      {}", hashes.multi_wildcard);
    println!("*:        {}", hashes.single_wildcard);

    let contract = args
        .contract
        .unwrap_or_else(|| ClientId::new_primary(salt).contract());
    let access = Access::from_type_chars(&args.access);
    let key = codec.generate(
        contract,
        &topic.literal_hashes(),
        access,
        None,
        SystemClock.unix_now(),
    );
    println!("contract: {contract}");
    println!("key:      {key}");
    Ok(())
}
