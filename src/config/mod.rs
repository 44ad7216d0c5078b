use crate::command::Disposition;
use crate::store::Partition;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub telemetry: TelemetryConfig,
	pub server: ServerConfig,
	pub services: ServicesConfig,
	pub devices: DeviceCacheConfig,
	pub query: QueryConfig,
	pub files: FileConfig,
	pub store: StoreConfig,
	pub forward: ForwardConfig,
	#[serde(default)]
	pub partitions: Vec<Partition>,
}

impl AppConfig {
	pub fn new() -> Result<Self, config::ConfigError> {
		use config::Config;
		let s = Config::builder()
			.add_source(config::File::from_str(
				include_str!("defaults.toml"),
				config::FileFormat::Toml,
			))
			.add_source(config::File::with_name("config.toml").required(false))
			.add_source(config::Environment::with_prefix("PACS_SCP").separator("__"))
			.build()?;

		s.try_deserialize()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
	// Configurable logging level. Also configurable via RUST_LOG and PACS_SCP_TELEMETRY__LEVEL
	pub level: String,
	/// Sentry DSN. Leave unset to disable Sentry.
	pub sentry: Option<String>,
}

impl TelemetryConfig {
	pub fn level(&self) -> Level {
		Level::from_str(&self.level).unwrap_or(Level::INFO)
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
	/// The AE title used when no partition matches the called AE title.
	pub aet: String,
	pub interface: IpAddr,
	pub port: u16,
	/// Upper bound for concurrently open associations. Further connections are closed immediately.
	pub max_associations: usize,
	/// Only accept uncompressed transfer syntaxes.
	pub uncompressed: bool,
	/// Maximum size of outgoing P-DATA fragments.
	pub max_pdu_length: u32,
	/// Read and write timeout of established associations, in milliseconds.
	pub timeout: u64,
	/// Number of find/move operations that may run concurrently across all associations.
	pub workers: usize,
}

impl ServerConfig {
	pub const fn timeout(&self) -> Duration {
		Duration::from_millis(self.timeout)
	}
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct ServicesConfig {
	pub verification: bool,
	pub storage: bool,
	pub query: bool,
	pub retrieve: bool,
	/// Receive enhanced and multi-frame objects straight into a temp file.
	pub streaming: bool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DeviceCacheConfig {
	/// Lifetime of a cached device, in seconds.
	pub ttl: u64,
	/// Interval of the expiry sweep, in seconds.
	pub sweep_interval: u64,
}

impl DeviceCacheConfig {
	pub const fn ttl(&self) -> Duration {
		Duration::from_secs(self.ttl)
	}

	pub const fn sweep_interval(&self) -> Duration {
		Duration::from_secs(self.sweep_interval)
	}
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct QueryConfig {
	/// Number of pending responses collected before they are written to the association.
	pub buffered_responses: usize,
	/// Maximum number of matches returned per query. -1 disables the limit.
	pub max_responses: i64,
	/// Always answer with ISO_IR 192 as specific character set.
	pub unicode_responses: bool,
}

impl QueryConfig {
	pub fn max_responses(&self) -> Option<usize> {
		usize::try_from(self.max_responses).ok()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
	pub disposition: Disposition,
	pub temp_dir: PathBuf,
	pub backup_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
	/// JSON document backing the persistent store. In-memory only when unset.
	pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ForwardConfig {
	/// Connect, read and write timeout of outbound associations, in milliseconds.
	pub timeout: u64,
	/// Wait for a free outbound association of a throttled device, in milliseconds.
	pub queue_timeout: u64,
	pub max_pdu_length: u32,
}

impl ForwardConfig {
	pub const fn timeout(&self) -> Duration {
		Duration::from_millis(self.timeout)
	}

	pub const fn queue_timeout(&self) -> Duration {
		Duration::from_millis(self.queue_timeout)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_deserialize() {
		let config: AppConfig = config::Config::builder()
			.add_source(config::File::from_str(
				include_str!("defaults.toml"),
				config::FileFormat::Toml,
			))
			.build()
			.and_then(config::Config::try_deserialize)
			.expect("defaults.toml should deserialize");

		assert_eq!(config.devices.ttl, 150);
		assert_eq!(config.query.max_responses(), None);
		assert_eq!(config.partitions.len(), 1);
		assert_eq!(config.telemetry.level(), Level::INFO);
		assert_eq!(config.forward.queue_timeout(), Duration::from_secs(300));
	}
}
