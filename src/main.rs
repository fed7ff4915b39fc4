use alcub_csi::attach::{NodeAttachService, NodeLabelHealth};
use alcub_csi::backend::{AlcubApi, KubeParamsSource, RadosUrlResolver, RbdImages, SystemRunner};
use alcub_csi::config::{Cli, Command, Config, interface_ip};
use alcub_csi::controller::ControllerService;
use alcub_csi::crd::AlcubVolume;
use alcub_csi::csi::{CsiController, CsiMetrics, CsiNode, IdentityService, SystemMounter, metrics, server};
use alcub_csi::health::{self, NodeHealthWatcher};
use alcub_csi::store::KubeStore;
use alcub_csi::volume::{self, VolumeRegistry};
use anyhow::Context;
use clap::Parser;
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client};
use prometheus::Registry;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "alcub_csi=debug,info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn serve_metrics(config: &Config, registry: Arc<Registry>) -> anyhow::Result<()> {
    match config.metrics_addr()? {
        Some(addr) => metrics::serve(addr, registry).await,
        None => std::future::pending().await,
    }
}

async fn warm_registry(client: &Client) -> anyhow::Result<Arc<VolumeRegistry>> {
    let registry = Arc::new(VolumeRegistry::new(Arc::new(KubeStore::<AlcubVolume>::new(client.clone()))));
    registry.warm().await.context("Failed to load volume records")?;
    Ok(registry)
}

async fn run_controller(config: Config) -> anyhow::Result<()> {
    let client = Client::try_default().await.context("Failed to create Kubernetes client")?;
    let prometheus = Arc::new(Registry::new());
    let csi_metrics = Arc::new(CsiMetrics::new(prometheus.clone())?);
    let registry = warm_registry(&client).await?;

    let runner = Arc::new(SystemRunner::new(config.command_timeout()));
    let resolver = Arc::new(RadosUrlResolver::new(runner.clone(), config.backend.pool.clone()));
    let devices = Arc::new(AlcubApi::new(config.api_settings(), resolver)?);
    let params = Arc::new(KubeParamsSource::new(client.clone()));
    let images = Arc::new(RbdImages::new(runner, params, config.backend.client_id.clone()));
    let controller = Arc::new(ControllerService::new(registry.clone(), images, devices));

    let watcher = Arc::new(
        NodeHealthWatcher::new(
            Arc::new(KubeStore::<Node>::new(client.clone())),
            controller.clone(),
            config.health_labels()?,
        )
        .with_metrics(csi_metrics.clone()),
    );

    let identity = IdentityService::new(config.csi.driver_name.clone());
    let csi = CsiController::new(controller).with_metrics(csi_metrics);

    tokio::select! {
        res = server::serve_controller(identity, csi, &config.csi.endpoint) => res,
        res = serve_metrics(&config, prometheus) => res,
        () = volume::run(registry, Api::<AlcubVolume>::all(client.clone())) => Ok(()),
        () = health::run(watcher, Api::<Node>::all(client)) => Ok(()),
    }
}

async fn run_node(config: Config) -> anyhow::Result<()> {
    let storage_ip = interface_ip(&config.csi.storage_interface)?;
    let client = Client::try_default().await.context("Failed to create Kubernetes client")?;
    let prometheus = Arc::new(Registry::new());
    let csi_metrics = Arc::new(CsiMetrics::new(prometheus.clone())?);
    let registry = warm_registry(&client).await?;
    let labels = config.health_labels()?;

    let runner = Arc::new(SystemRunner::new(config.command_timeout()));
    let resolver = Arc::new(RadosUrlResolver::new(runner.clone(), config.backend.pool.clone()));
    let devices = Arc::new(AlcubApi::new(config.api_settings(), resolver)?);
    let holders = Arc::new(NodeLabelHealth::new(Arc::new(KubeStore::<Node>::new(client.clone())), labels.fenced));
    let attach = Arc::new(NodeAttachService::new(
        config.csi.node_name.clone(),
        storage_ip,
        registry.clone(),
        devices,
        holders,
    ));
    tracing::info!("Node {} uses storage address {}", config.csi.node_name, storage_ip);

    let identity = IdentityService::new(config.csi.driver_name.clone());
    let csi = CsiNode::new(attach, Arc::new(SystemMounter::new(runner)), config.csi.max_volumes_per_node)
        .with_metrics(csi_metrics);

    tokio::select! {
        res = server::serve_node(identity, csi, &config.csi.endpoint) => res,
        res = serve_metrics(&config, prometheus) => res,
        () = volume::run(registry, Api::<AlcubVolume>::all(client)) => Ok(()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = Config::load(&cli.config)?;
    match &cli.command {
        Command::Controller(args) => {
            args.apply(&mut config);
            config.validate_controller()?;
            tracing::info!("Starting alcub-csi controller {}", env!("CARGO_PKG_VERSION"));
            run_controller(config).await
        }
        Command::Node(args) => {
            args.apply(&mut config);
            config.validate_node()?;
            tracing::info!("Starting alcub-csi node plugin {}", env!("CARGO_PKG_VERSION"));
            run_node(config).await
        }
    }
}
