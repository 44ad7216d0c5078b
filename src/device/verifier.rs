use super::DeviceCache;
use crate::store::{Device, Partition, PartitionStore};
use dicom::ul::association::server::AccessControl;
use dicom::ul::pdu::{AssociationRJServiceUserReason, UserIdentity};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectResult {
	Permanent,
	Transient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectSource {
	ServiceUser,
	ServiceProviderAcse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
	NoReasonGiven,
	CallingAeNotRecognized,
	CalledAeNotRecognized,
}

impl From<RejectReason> for AssociationRJServiceUserReason {
	fn from(reason: RejectReason) -> Self {
		match reason {
			RejectReason::NoReasonGiven => Self::NoReasonGiven,
			RejectReason::CallingAeNotRecognized => Self::CallingAETitleNotRecognized,
			RejectReason::CalledAeNotRecognized => Self::CalledAETitleNotRecognized,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
	Accept {
		partition: Partition,
		/// `None` for unknown callers of a partition that accepts any device
		/// without provisioning it.
		device: Option<Device>,
	},
	Reject {
		result: RejectResult,
		source: RejectSource,
		reason: RejectReason,
	},
}

impl Verdict {
	const fn reject(result: RejectResult, reason: RejectReason) -> Self {
		Self::Reject {
			result,
			source: RejectSource::ServiceUser,
			reason,
		}
	}
}

/// Decides whether an association request is accepted.
pub struct AssociationVerifier {
	partitions: Arc<dyn PartitionStore>,
	devices: Arc<DeviceCache>,
}

impl AssociationVerifier {
	pub fn new(partitions: Arc<dyn PartitionStore>, devices: Arc<DeviceCache>) -> Self {
		Self { partitions, devices }
	}

	pub async fn verify(&self, called_ae: &str, calling_ae: &str, remote: IpAddr) -> Verdict {
		let partition = match self.partitions.find_partition(called_ae).await {
			Ok(Some(partition)) if partition.enabled => partition,
			Ok(_) => {
				warn!(called_ae, calling_ae, "Rejected association for unknown or disabled partition");
				return Verdict::reject(RejectResult::Permanent, RejectReason::CalledAeNotRecognized);
			}
			Err(err) => {
				error!(called_ae, "Failed to load partition: {err}");
				return Verdict::reject(RejectResult::Transient, RejectReason::NoReasonGiven);
			}
		};

		match self.devices.lookup_device(&partition, calling_ae, remote).await {
			Ok(Some((device, _))) if !device.enabled => {
				warn!(called_ae, calling_ae, "Rejected association from disabled device");
				Verdict::reject(RejectResult::Permanent, RejectReason::NoReasonGiven)
			}
			Ok(Some((device, is_new))) => {
				info!(called_ae, calling_ae, is_new, "Accepted association");
				Verdict::Accept {
					partition,
					device: Some(device),
				}
			}
			Ok(None) if partition.accept_any_device => {
				info!(called_ae, calling_ae, "Accepted association from unknown device");
				Verdict::Accept {
					partition,
					device: None,
				}
			}
			Ok(None) => {
				warn!(called_ae, calling_ae, "Rejected association from unknown device");
				Verdict::reject(RejectResult::Permanent, RejectReason::CallingAeNotRecognized)
			}
			Err(err) => {
				error!(called_ae, calling_ae, "Failed to resolve device: {err}");
				Verdict::reject(RejectResult::Transient, RejectReason::NoReasonGiven)
			}
		}
	}
}

/// Plugs the verifier into association establishment.
///
/// Establishment runs on the association's blocking thread, so the verifier is driven
/// through a runtime handle. The verdict is kept for the connection task.
pub struct DeviceAccessControl {
	verifier: Arc<AssociationVerifier>,
	handle: Handle,
	remote: IpAddr,
	verdict: Arc<Mutex<Option<Verdict>>>,
}

impl DeviceAccessControl {
	pub fn new(verifier: Arc<AssociationVerifier>, handle: Handle, remote: IpAddr) -> Self {
		Self {
			verifier,
			handle,
			remote,
			verdict: Arc::default(),
		}
	}

	/// Slot receiving the verdict once the association request was checked.
	pub fn verdict(&self) -> Arc<Mutex<Option<Verdict>>> {
		Arc::clone(&self.verdict)
	}
}

impl AccessControl for DeviceAccessControl {
	fn check_access(
		&self,
		_this_ae_title: &str,
		calling_ae_title: &str,
		called_ae_title: &str,
		_user_identity: Option<&UserIdentity>,
	) -> Result<(), AssociationRJServiceUserReason> {
		let verdict = self.handle.block_on(self.verifier.verify(
			called_ae_title.trim(),
			calling_ae_title.trim(),
			self.remote,
		));
		let outcome = match &verdict {
			Verdict::Accept { .. } => Ok(()),
			Verdict::Reject { reason, .. } => Err((*reason).into()),
		};
		if let Ok(mut slot) = self.verdict.lock() {
			*slot = Some(verdict);
		}
		outcome
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::device::cache::tests::{device, partition};
	use crate::store::{DeviceStore, JsonStore};
	use std::net::Ipv4Addr;
	use std::time::Duration;

	const REMOTE: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

	fn verifier(store: &Arc<JsonStore>) -> AssociationVerifier {
		let cache = DeviceCache::new(Arc::clone(store) as Arc<dyn DeviceStore>, Duration::from_secs(150));
		AssociationVerifier::new(Arc::clone(store) as Arc<dyn PartitionStore>, Arc::new(cache))
	}

	#[tokio::test]
	async fn unknown_calling_ae_is_rejected_permanently() {
		let store = Arc::new(JsonStore::in_memory(vec![partition(false)]));
		let verdict = verifier(&store).verify("ARCHIVE", "UNKNOWN1", REMOTE).await;
		assert_eq!(
			verdict,
			Verdict::Reject {
				result: RejectResult::Permanent,
				source: RejectSource::ServiceUser,
				reason: RejectReason::CallingAeNotRecognized,
			}
		);
	}

	#[tokio::test]
	async fn unknown_or_disabled_partition_is_rejected() {
		let mut disabled = partition(true);
		disabled.ae_title = String::from("OFFLINE");
		disabled.enabled = false;
		let store = Arc::new(JsonStore::in_memory(vec![partition(true), disabled]));
		let verifier = verifier(&store);

		for called in ["NOWHERE", "OFFLINE"] {
			assert!(matches!(
				verifier.verify(called, "CT1", REMOTE).await,
				Verdict::Reject {
					reason: RejectReason::CalledAeNotRecognized,
					..
				}
			));
		}
	}

	#[tokio::test]
	async fn disabled_device_is_rejected() {
		let store = Arc::new(JsonStore::in_memory(vec![partition(false)]));
		let mut disabled = device("CT1", false);
		disabled.enabled = false;
		store.insert_device(disabled).await.unwrap();

		assert_eq!(
			verifier(&store).verify("ARCHIVE", "CT1", REMOTE).await,
			Verdict::reject(RejectResult::Permanent, RejectReason::NoReasonGiven)
		);
	}

	#[tokio::test]
	async fn known_device_is_accepted() {
		let store = Arc::new(JsonStore::in_memory(vec![partition(false)]));
		store.insert_device(device("CT1", false)).await.unwrap();

		let verdict = verifier(&store).verify("ARCHIVE", "CT1", REMOTE).await;
		assert!(matches!(verdict, Verdict::Accept { device: Some(ref d), .. } if d.ae_title == "CT1"));
	}

	#[test]
	fn access_control_reports_reason() {
		let runtime = tokio::runtime::Runtime::new().unwrap();
		let store = Arc::new(JsonStore::in_memory(vec![partition(false)]));
		let control =
			DeviceAccessControl::new(Arc::new(verifier(&store)), runtime.handle().clone(), REMOTE);

		let result = control.check_access("ARCHIVE", "UNKNOWN1", "ARCHIVE", None);
		assert_eq!(result, Err(AssociationRJServiceUserReason::CallingAETitleNotRecognized));
		assert!(matches!(
			*control.verdict().lock().unwrap(),
			Some(Verdict::Reject { .. })
		));
	}
}
