//! Minimal process entry point: loads a TOML settings file, wires each configured namespace up
//! with a real clock, object store, and peer set, then serves the wire contract over `axum`
//! until interrupted.
//!
//! The TOML *loader* proper (secret interpolation, rotation, CLI-flag merge) is an external
//! collaborator — this binary does the minimum `toml::from_str` needed to turn a
//! config file into [`blobby::Settings`] values so the engine is actually runnable: a thin
//! transport binary, not a full front-end.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use blobby::{
    config::{PeerConfig, Settings},
    http::{router, AppState},
    metrics::NamespaceMetrics,
    namespace::Storage,
    object_store::{ObjectStore, S3ObjectStore},
    remote::{HttpRemote, Remote},
    shared::Shared,
};
use blobby_buffers::{DelayQueue, WorkQueue};
use blobby_common::{Clock, SystemClock};
use blobby_keyfmt::KeyTemplate;
use clap::Parser;
use serde::Deserialize;
use tracing::info;

/// One cluster node's complete on-disk configuration: the address this process binds for peer
/// and client traffic, and the per-namespace settings making up `blobby::Settings`.
#[derive(Debug, Deserialize)]
struct FileConfig {
    listen: SocketAddr,
    #[serde(default)]
    s3_endpoint: Option<String>,
    namespace: HashMap<String, Settings>,
}

#[derive(Debug, Parser)]
#[command(name = "blobbyd", about = "Namespaced, replicated, append-only blob buffer")]
struct Args {
    /// Path to the TOML settings file.
    #[arg(short, long, default_value = "blobbyd.toml")]
    config: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let raw = tokio::fs::read_to_string(&args.config).await?;
    let file_config: FileConfig = toml::from_str(&raw)?;

    let aws_config = match &file_config.s3_endpoint {
        Some(endpoint) => {
            aws_config::defaults(aws_config::BehaviorVersion::latest())
                .endpoint_url(endpoint)
                .load()
                .await
        }
        None => aws_config::defaults(aws_config::BehaviorVersion::latest()).load().await,
    };
    let s3_client = aws_sdk_s3::Client::new(&aws_config);

    let mut namespaces = HashMap::new();
    for (name, settings) in file_config.namespace {
        settings
            .validate()
            .map_err(|reason| format!("namespace '{name}' has an invalid configuration: {reason}"))?;
        let storage = build_namespace(&name, settings, s3_client.clone()).await?;
        storage.start().await?;
        namespaces.insert(name, storage);
    }

    let app = router(AppState::new(namespaces.clone()));
    let listener = tokio::net::TcpListener::bind(file_config.listen).await?;
    info!(addr = %file_config.listen, namespaces = namespaces.len(), "blobbyd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for storage in namespaces.values() {
        storage.stop().await;
    }
    Ok(())
}

async fn build_namespace(
    name: &str,
    settings: Settings,
    s3_client: aws_sdk_s3::Client,
) -> Result<Arc<Storage>, Box<dyn std::error::Error>> {
    let settings = Arc::new(settings);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let key_template = KeyTemplate::compile(&settings.key_format)?;
    let object_store: Arc<dyn ObjectStore> =
        Arc::new(S3ObjectStore::new(s3_client, settings.bucket.clone()));
    let remotes = build_remotes(&settings.peers);

    let shared = Arc::new(Shared {
        namespace: name.to_string(),
        settings: settings.clone(),
        clock,
        delay_queue: DelayQueue::start(),
        compress_queue: WorkQueue::new(settings.compress_parallelism),
        upload_queue: WorkQueue::new(settings.upload_parallelism),
        delete_local_queue: WorkQueue::new(settings.delete_local_parallelism),
        delete_remotes_queue: WorkQueue::new(settings.delete_remotes_parallelism),
        object_store,
        key_template,
        metrics: NamespaceMetrics::new(name),
        remotes,
        shutting_down: Arc::new(std::sync::atomic::AtomicBool::new(false)),
    });

    Ok(Storage::new(shared))
}

fn build_remotes(peers: &[PeerConfig]) -> Vec<Arc<dyn Remote>> {
    peers
        .iter()
        .map(|peer| {
            let base_url = if peer.address.starts_with("http") {
                peer.address.clone()
            } else {
                format!("http://{}", peer.address)
            };
            Arc::new(HttpRemote::new(peer.machine_id, base_url)) as Arc<dyn Remote>
        })
        .collect()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        let mut sig = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sig.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    // Give in-flight requests a moment to drain before the namespaces' own stop() cancels
    // outstanding uploads and peer RPCs.
    tokio::time::sleep(Duration::from_millis(50)).await;
}
