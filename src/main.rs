pub(crate) mod audit;
pub(crate) mod command;
pub(crate) mod config;
pub(crate) mod descriptor;
pub(crate) mod device;
pub(crate) mod dimse;
pub(crate) mod forward;
pub(crate) mod import;
pub(crate) mod scp;
pub(crate) mod store;
pub(crate) mod types;

use crate::config::AppConfig;
use crate::descriptor::{DescriptorStore, JsonDescriptorStore};
use crate::device::{AssociationVerifier, DeviceCache};
use crate::forward::{DimseConnector, Forwarder};
use crate::import::FilesystemImporter;
use crate::scp::echo::VerificationServiceProvider;
use crate::scp::query::QueryServiceProvider;
use crate::scp::retrieve::MoveServiceProvider;
use crate::scp::server::DicomServer;
use crate::scp::store::StorageServiceProvider;
use crate::scp::ServiceRegistry;
use crate::store::{
	DeviceStore, JsonStore, PartitionStore, PreferredSyntaxStore, StudyIndex, StudyLocator,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// The implementation class UID written to the file meta group of received instances.
/// The UID is a randomly generated UUID represented as a single integer value under the 2.25 root.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.226831519830290465216839215497408931533";

/// The implementation version name, "PACS-SCP" followed by the crate version.
pub const IMPLEMENTATION_VERSION_NAME: &str = concat!("PACS-SCP ", env!("CARGO_PKG_VERSION"));

fn init_logger(level: tracing::Level) {
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::fmt::layer()
				.compact()
				.with_ansi(true)
				.with_file(false)
				.with_line_number(false)
				.with_target(false),
		)
		.with(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(level).into())
				.from_env_lossy(),
		)
		.with(sentry::integrations::tracing::layer())
		.init();
}

fn init_sentry(config: &AppConfig) -> sentry::ClientInitGuard {
	let guard = sentry::init((
		// An empty string will disable Sentry
		config.telemetry.sentry.as_deref().unwrap_or_default(),
		sentry::ClientOptions {
			release: sentry::release_name!(),
			traces_sample_rate: 1.0,
			..Default::default()
		},
	));

	if let Some(dsn) = &config.telemetry.sentry {
		info!(dsn, "Enabled Sentry for tracing and error tracking");
	};

	guard
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
	let config = AppConfig::new()?;
	init_logger(config.telemetry.level());

	// Manually create the Tokio runtime because the Sentry client needs to be created *before* the
	// Tokio runtime, which prevents us from using the #[tokio::main] macro.
	// See https://docs.sentry.io/platforms/rust/#async-main-function
	let _sentry = init_sentry(&config);

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(async move {
			if let Err(error) = run(config).await {
				error!("Failed to start application due to error: {error}");
			}
		});
	Ok(())
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
	let store = Arc::new(JsonStore::open(config.store.path.clone(), config.partitions.clone()).await?);
	let descriptors: Arc<dyn DescriptorStore> = Arc::new(JsonDescriptorStore);
	let shutdown = CancellationToken::new();

	let devices = Arc::new(DeviceCache::new(
		Arc::clone(&store) as Arc<dyn DeviceStore>,
		config.devices.ttl(),
	));
	let sweeper = devices.spawn_sweeper(config.devices.sweep_interval(), shutdown.child_token());
	let verifier = Arc::new(AssociationVerifier::new(
		Arc::clone(&store) as Arc<dyn PartitionStore>,
		Arc::clone(&devices),
	));

	let mut registry = ServiceRegistry::new();
	let services = config.services;
	if services.verification {
		registry.register(Arc::new(VerificationServiceProvider));
	}
	if services.storage {
		let importer = FilesystemImporter::new(
			Arc::clone(&store) as Arc<dyn StudyLocator>,
			Arc::clone(&store) as Arc<dyn StudyIndex>,
			Arc::clone(&descriptors),
			config.files.clone(),
		);
		registry.register(Arc::new(StorageServiceProvider::new(
			Arc::new(importer),
			config.files.temp_dir.clone(),
			services.streaming,
		)));
	}
	if services.query {
		registry.register(Arc::new(QueryServiceProvider::new(
			Arc::clone(&store) as Arc<dyn StudyIndex>,
			Arc::clone(&store) as Arc<dyn StudyLocator>,
			Arc::clone(&descriptors),
			config.query,
		)));
	}
	if services.retrieve {
		let connector = DimseConnector::new(config.forward.timeout(), config.forward.max_pdu_length);
		let forwarder = Forwarder::new(
			Arc::new(connector),
			Arc::clone(&store) as Arc<dyn PreferredSyntaxStore>,
			config.forward.timeout(),
			config.forward.queue_timeout(),
		);
		registry.register(Arc::new(MoveServiceProvider::new(
			Arc::clone(&store) as Arc<dyn DeviceStore>,
			Arc::clone(&store) as Arc<dyn StudyIndex>,
			Arc::clone(&store) as Arc<dyn StudyLocator>,
			Arc::clone(&descriptors),
			Arc::new(forwarder),
		)));
	}
	if registry.is_empty() {
		anyhow::bail!("All DICOM services are disabled");
	}

	let partitions = store.partitions().await?;
	let server = DicomServer::new(config.server.clone(), registry, verifier, &partitions);

	let listener_shutdown = shutdown.clone();
	tokio::spawn(async move {
		shutdown_signal().await;
		info!("Received shutdown signal");
		listener_shutdown.cancel();
	});

	let result = server.spawn(shutdown.clone()).await;
	shutdown.cancel();
	if let Err(err) = sweeper.await {
		error!("Device cache sweeper failed: {err}");
	}
	result
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(err) = signal::ctrl_c().await {
			error!("Failed to listen for Ctrl+C: {err}");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut terminate) => {
				terminate.recv().await;
			}
			Err(err) => {
				error!("Failed to listen for SIGTERM: {err}");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => {},
		() = terminate => {},
	}
}
