use crate::store::{Device, DeviceStore, Partition, StoreError};
use crate::types::AE;
use chrono::Utc;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

#[derive(Debug, Error)]
pub enum LookupError {
	#[error("Failed to query device: {0}")]
	Store(#[from] StoreError),
}

struct CachedDevice {
	device: Device,
	expires: Instant,
}

impl CachedDevice {
	fn is_live(&self, now: Instant) -> bool {
		self.expires > now
	}
}

/// Time bounded cache of devices keyed by partition and AE title.
///
/// Entries are published only after the store accepted the corresponding write.
/// An entry is never served past its TTL: expiry is checked on every read and a
/// sweeper task drops expired entries periodically.
pub struct DeviceCache {
	store: Arc<dyn DeviceStore>,
	ttl: Duration,
	entries: DashMap<(AE, AE), CachedDevice>,
}

impl DeviceCache {
	pub fn new(store: Arc<dyn DeviceStore>, ttl: Duration) -> Self {
		Self {
			store,
			ttl,
			entries: DashMap::new(),
		}
	}

	/// Resolves the device behind a calling AE title.
	///
	/// Returns the device and whether it was created by this lookup, or `None` if the
	/// partition neither knows the device nor provisions unknown devices.
	#[instrument(skip_all, fields(partition = %partition.ae_title, calling_ae = %calling_ae))]
	pub async fn lookup_device(
		&self,
		partition: &Partition,
		calling_ae: &str,
		remote: IpAddr,
	) -> Result<Option<(Device, bool)>, LookupError> {
		let key = (partition.ae_title.clone(), AE::from(calling_ae));
		let now = Instant::now();
		if let Some(cached) = self.entries.get(&key) {
			let moved = cached.device.dhcp && cached.device.ip_address != Some(remote);
			if cached.is_live(now) && !moved {
				return Ok(Some((cached.device.clone(), false)));
			}
		}
		self.entries.remove_if(&key, |_, cached| !cached.is_live(now));

		let (device, is_new) = match self.store.find_device(&partition.ae_title, calling_ae).await? {
			Some(mut device) => {
				if device.dhcp && device.ip_address != Some(remote) {
					info!(
						previous = ?device.ip_address,
						current = %remote,
						"Device address changed"
					);
					device.ip_address = Some(remote);
				}
				device.last_accessed = Some(Utc::now());
				self.store.update_device(&device).await?;
				(device, false)
			}
			None if partition.accept_any_device && partition.auto_insert_device => {
				let device = Device::auto_provisioned(&partition.ae_title, calling_ae, remote);
				self.store.insert_device(device.clone()).await?;
				info!(device_key = %device.key, "Added new device");
				(device, true)
			}
			None => return Ok(None),
		};

		self.entries.insert(
			key,
			CachedDevice {
				device: device.clone(),
				expires: Instant::now() + self.ttl,
			},
		);
		Ok(Some((device, is_new)))
	}

	/// Removes expired entries and returns how many were dropped.
	pub fn sweep(&self) -> usize {
		let now = Instant::now();
		let before = self.entries.len();
		self.entries.retain(|_, cached| cached.is_live(now));
		before.saturating_sub(self.entries.len())
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Sweeps expired entries every `interval` until `cancel` fires.
	pub fn spawn_sweeper(
		self: &Arc<Self>,
		interval: Duration,
		cancel: CancellationToken,
	) -> JoinHandle<()> {
		let cache = Arc::clone(self);
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			loop {
				tokio::select! {
					_ = ticker.tick() => {
						let removed = cache.sweep();
						if removed > 0 {
							debug!(removed, "Swept expired devices");
						}
					}
					() = cancel.cancelled() => {
						debug!("Device cache sweeper shutting down");
						break;
					}
				}
			}
		})
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use crate::store::{DuplicatePolicy, JsonStore};
	use std::net::Ipv4Addr;
	use std::path::PathBuf;
	use uuid::Uuid;

	pub fn partition(accept_any_device: bool) -> Partition {
		Partition {
			ae_title: AE::from("ARCHIVE"),
			description: String::new(),
			enabled: true,
			accept_any_device,
			auto_insert_device: accept_any_device,
			duplicate_policy: DuplicatePolicy::RejectDuplicates,
			root: PathBuf::from("archive"),
			implicit_only: false,
			primary_sources: Vec::new(),
			sop_classes: Vec::new(),
		}
	}

	pub fn device(ae_title: &str, dhcp: bool) -> Device {
		Device {
			key: Uuid::new_v4(),
			partition: AE::from("ARCHIVE"),
			ae_title: AE::from(ae_title),
			description: String::new(),
			ip_address: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
			port: 104,
			dhcp,
			enabled: true,
			allow_storage: true,
			allow_query: true,
			allow_retrieve: true,
			accept_kopr: false,
			max_outbound_associations: None,
			sop_classes: None,
			last_accessed: None,
		}
	}

	const REMOTE: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

	#[tokio::test]
	async fn lookups_within_ttl_hit_the_cache() {
		let store = Arc::new(JsonStore::in_memory(vec![partition(false)]));
		store.insert_device(device("CT1", false)).await.unwrap();
		let cache = DeviceCache::new(Arc::clone(&store) as Arc<dyn DeviceStore>, Duration::from_secs(150));

		let (first, is_new) = cache.lookup_device(&partition(false), "CT1", REMOTE).await.unwrap().unwrap();
		let (second, _) = cache.lookup_device(&partition(false), "CT1", REMOTE).await.unwrap().unwrap();

		assert!(!is_new);
		assert_eq!(first, second);
		assert_eq!(store.device_lookups(), 1);
		assert!(first.last_accessed.is_some());
	}

	#[tokio::test]
	async fn expired_entries_are_reloaded_and_swept() {
		let store = Arc::new(JsonStore::in_memory(vec![partition(false)]));
		store.insert_device(device("CT1", false)).await.unwrap();
		let cache = DeviceCache::new(Arc::clone(&store) as Arc<dyn DeviceStore>, Duration::ZERO);

		cache.lookup_device(&partition(false), "CT1", REMOTE).await.unwrap();
		cache.lookup_device(&partition(false), "CT1", REMOTE).await.unwrap();
		assert_eq!(store.device_lookups(), 2);

		assert_eq!(cache.sweep(), 1);
		assert!(cache.is_empty());
	}

	#[tokio::test]
	async fn unknown_devices_are_provisioned_when_allowed() {
		let store = Arc::new(JsonStore::in_memory(vec![partition(true)]));
		let cache = DeviceCache::new(Arc::clone(&store) as Arc<dyn DeviceStore>, Duration::from_secs(150));

		let (device, is_new) = cache.lookup_device(&partition(true), "NEW1", REMOTE).await.unwrap().unwrap();
		assert!(is_new);
		assert!(device.dhcp && device.allow_storage && device.allow_query && device.allow_retrieve);
		assert_eq!(device.ip_address, Some(REMOTE));
		assert!(store.find_device("ARCHIVE", "NEW1").await.unwrap().is_some());

		let closed = partition(false);
		assert!(cache.lookup_device(&closed, "NEW2", REMOTE).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn dhcp_address_drift_is_persisted() {
		let store = Arc::new(JsonStore::in_memory(vec![partition(false)]));
		store.insert_device(device("US1", true)).await.unwrap();
		let cache = DeviceCache::new(Arc::clone(&store) as Arc<dyn DeviceStore>, Duration::from_secs(150));
		let moved = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 99));

		cache.lookup_device(&partition(false), "US1", REMOTE).await.unwrap();
		let (device, _) = cache.lookup_device(&partition(false), "US1", moved).await.unwrap().unwrap();

		assert_eq!(device.ip_address, Some(moved));
		let stored = store.find_device("ARCHIVE", "US1").await.unwrap().unwrap();
		assert_eq!(stored.ip_address, Some(moved));
	}
}
