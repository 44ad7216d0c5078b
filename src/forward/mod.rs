//! Storage forwarder: sends a list of stored instances to a remote storage SCP.
//!
//! The [`Forwarder`] owns the [`WorkList`] of a single C-MOVE. Progress is handed to the
//! [`ProgressListener`] as [`Progress`] snapshots, so the listener never sees the
//! counters change under its feet.

mod scu;

pub use scu::DimseConnector;

use crate::dimse::association::client::ProposedContext;
use crate::dimse::association::AssociationError;
use crate::dimse::cmove::SubOperations;
use crate::dimse::{status, ReadError, StatusType, WriteError};
use crate::store::{Device, Partition, PreferredSyntaxStore};
use crate::types::{AE, UI, US};
use async_trait::async_trait;
use dashmap::DashMap;
use dicom::dictionary_std::uids;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Sub-operations are reported every this many remaining instances.
const REPORT_INTERVAL: usize = 5;

#[derive(Debug, Error)]
pub enum ForwardError {
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error("Failed to open {path}: {source}")]
	File {
		path: PathBuf,
		source: dicom::object::ReadError,
	},
	#[error("No presentation context was accepted for SOP class {0}")]
	NoPresentationContext(UI),
	#[error("Cannot send {stored} data as {negotiated}")]
	TransferSyntax { stored: UI, negotiated: UI },
	#[error(transparent)]
	Join(#[from] tokio::task::JoinError),
}

impl ForwardError {
	/// Whether the association is unusable after this error.
	pub const fn is_transport(&self) -> bool {
		matches!(self, Self::Association(_) | Self::Read(_) | Self::Write(_))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
	Pending,
	Success,
	Warning,
	Failure,
}

impl SendStatus {
	pub fn from_status(status: US) -> Self {
		match StatusType::try_from(status) {
			Ok(StatusType::Success) => Self::Success,
			Ok(StatusType::Warning) => Self::Warning,
			_ => Self::Failure,
		}
	}
}

/// One instance to forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageInstance {
	pub path: PathBuf,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub transfer_syntax_uid: UI,
	pub status: SendStatus,
	pub failure_description: Option<String>,
}

impl StorageInstance {
	pub fn new(
		path: PathBuf,
		sop_class_uid: impl Into<UI>,
		sop_instance_uid: impl Into<UI>,
		transfer_syntax_uid: impl Into<UI>,
	) -> Self {
		Self {
			path,
			sop_class_uid: sop_class_uid.into(),
			sop_instance_uid: sop_instance_uid.into(),
			transfer_syntax_uid: transfer_syntax_uid.into(),
			status: SendStatus::Pending,
			failure_description: None,
		}
	}
}

/// A snapshot of the sub-operation counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
	pub remaining: usize,
	pub completed: usize,
	pub failed: usize,
	pub warning: usize,
}

fn saturate(count: usize) -> US {
	US::try_from(count).unwrap_or(US::MAX)
}

impl From<Progress> for SubOperations {
	fn from(progress: Progress) -> Self {
		Self {
			remaining: saturate(progress.remaining),
			completed: saturate(progress.completed),
			failed: saturate(progress.failed),
			warning: saturate(progress.warning),
		}
	}
}

#[derive(Debug, Default, Clone)]
pub struct WorkList {
	instances: Vec<StorageInstance>,
}

impl WorkList {
	pub fn push(&mut self, instance: StorageInstance) {
		self.instances.push(instance);
	}

	pub fn len(&self) -> usize {
		self.instances.len()
	}

	pub fn is_empty(&self) -> bool {
		self.instances.is_empty()
	}

	pub fn instances(&self) -> &[StorageInstance] {
		&self.instances
	}

	pub fn record(&mut self, index: usize, status: SendStatus, description: Option<String>) -> Progress {
		if let Some(instance) = self.instances.get_mut(index) {
			instance.status = status;
			instance.failure_description = description;
		}
		self.progress()
	}

	/// Marks every instance that was not sent yet as failed.
	pub fn fail_remaining(&mut self, description: &str) {
		for instance in &mut self.instances {
			if instance.status == SendStatus::Pending {
				instance.status = SendStatus::Failure;
				instance.failure_description = Some(description.to_owned());
			}
		}
	}

	pub fn progress(&self) -> Progress {
		self.instances
			.iter()
			.fold(Progress::default(), |mut progress, instance| {
				match instance.status {
					SendStatus::Pending => progress.remaining += 1,
					SendStatus::Success => progress.completed += 1,
					SendStatus::Warning => progress.warning += 1,
					SendStatus::Failure => progress.failed += 1,
				}
				progress
			})
	}

	pub fn failed_sop_instance_uids(&self) -> Vec<UI> {
		self.instances
			.iter()
			.filter(|instance| !matches!(instance.status, SendStatus::Success | SendStatus::Warning))
			.map(|instance| instance.sop_instance_uid.clone())
			.collect()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
	Completed,
	Cancelled,
	ConnectFailed,
	/// No outbound association to the destination became free in time.
	Unavailable,
}

/// Status of the final C-MOVE-RSP.
pub fn final_status(outcome: ForwardOutcome, progress: Progress, source_nearline: bool) -> US {
	match outcome {
		ForwardOutcome::Cancelled => status::CANCEL,
		ForwardOutcome::ConnectFailed => status::MOVE_DESTINATION_UNKNOWN,
		ForwardOutcome::Unavailable => status::UNABLE_TO_PERFORM_SUBOPERATIONS,
		ForwardOutcome::Completed if progress.failed > 0 => status::SUB_OPERATIONS_ONE_OR_MORE_FAILURES,
		ForwardOutcome::Completed if source_nearline => status::UNABLE_TO_PERFORM_SUBOPERATIONS,
		ForwardOutcome::Completed => status::SUCCESS,
	}
}

/// Pending responses are only sent every few sub-operations.
pub const fn should_report(progress: Progress) -> bool {
	progress.remaining > 0 && progress.remaining % REPORT_INTERVAL == 0
}

#[async_trait]
pub trait ProgressListener: Send {
	async fn pending(&mut self, progress: Progress);
}

/// Originator of the C-MOVE the instances are sent for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveOriginator {
	pub ae_title: AE,
	pub message_id: US,
}

#[derive(Debug, Clone)]
pub struct ForwardTarget {
	pub device: Device,
	pub address: SocketAddr,
}

/// Opens an association to a forward target.
#[async_trait]
pub trait Connector: Send + Sync {
	async fn connect(
		&self,
		calling_ae: &str,
		target: &ForwardTarget,
		contexts: Vec<ProposedContext>,
	) -> Result<Box<dyn InstanceSender>, ForwardError>;
}

/// An established association that C-STOREs instances.
#[async_trait]
pub trait InstanceSender: Send {
	/// Sends one instance and returns the status of the C-STORE-RSP.
	async fn send(
		&mut self,
		instance: &StorageInstance,
		originator: Option<&MoveOriginator>,
	) -> Result<US, ForwardError>;

	async fn release(self: Box<Self>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleError {
	Cancelled,
	TimedOut,
}

struct Slots {
	limit: usize,
	semaphore: Arc<Semaphore>,
}

impl Slots {
	fn new(limit: usize) -> Self {
		Self {
			limit,
			semaphore: Arc::new(Semaphore::new(limit)),
		}
	}
}

/// Limits concurrent outbound associations per device.
#[derive(Default)]
pub struct DeviceThrottle {
	slots: DashMap<Uuid, Slots>,
}

impl DeviceThrottle {
	/// Waits for a free slot. Devices without limit are not throttled.
	/// A changed limit replaces the slots; permits of the old ones stay valid until released.
	pub async fn acquire(
		&self,
		device: &Device,
		timeout: Duration,
		cancel: &CancellationToken,
	) -> Result<Option<OwnedSemaphorePermit>, ThrottleError> {
		let Some(limit) = device.max_outbound_associations.filter(|limit| *limit > 0) else {
			return Ok(None);
		};
		let semaphore = {
			let mut slots = self.slots.entry(device.key).or_insert_with(|| Slots::new(limit));
			if slots.limit != limit {
				debug!(ae_title = %device.ae_title, limit, "Outbound association limit changed");
				*slots = Slots::new(limit);
			}
			Arc::clone(&slots.semaphore)
		};
		tokio::select! {
			() = cancel.cancelled() => Err(ThrottleError::Cancelled),
			permit = tokio::time::timeout(timeout, semaphore.acquire_owned()) => match permit {
				Ok(permit) => Ok(permit.ok()),
				Err(_) => Err(ThrottleError::TimedOut),
			},
		}
	}
}

#[derive(Debug)]
pub struct ForwardRequest {
	pub partition: Partition,
	pub target: ForwardTarget,
	pub originator: Option<MoveOriginator>,
	pub work: WorkList,
}

#[derive(Debug)]
pub struct ForwardReport {
	pub outcome: ForwardOutcome,
	pub progress: Progress,
	pub failed_sop_instance_uids: Vec<UI>,
}

const NATIVE_TRANSFER_SYNTAXES: &[&str] = &[
	uids::IMPLICIT_VR_LITTLE_ENDIAN,
	uids::EXPLICIT_VR_LITTLE_ENDIAN,
	uids::EXPLICIT_VR_BIG_ENDIAN,
	uids::DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN,
];

/// Whether the data set can be re-encoded in any other native transfer syntax.
pub fn is_native(transfer_syntax_uid: &str) -> bool {
	NATIVE_TRANSFER_SYNTAXES.contains(&transfer_syntax_uid.trim_end_matches('\0'))
}

pub struct Forwarder {
	connector: Arc<dyn Connector>,
	preferred: Arc<dyn PreferredSyntaxStore>,
	throttle: DeviceThrottle,
	connect_timeout: Duration,
	queue_timeout: Duration,
}

impl Forwarder {
	/// `queue_timeout` bounds the wait for a free outbound association of a throttled device.
	pub fn new(
		connector: Arc<dyn Connector>,
		preferred: Arc<dyn PreferredSyntaxStore>,
		connect_timeout: Duration,
		queue_timeout: Duration,
	) -> Self {
		Self {
			connector,
			preferred,
			throttle: DeviceThrottle::default(),
			connect_timeout,
			queue_timeout,
		}
	}

	/// Fails or keeps the whole work list when no association could be opened.
	fn abandoned(outcome: ForwardOutcome, mut work: WorkList, description: &str) -> ForwardReport {
		if outcome != ForwardOutcome::Cancelled {
			work.fail_remaining(description);
		}
		ForwardReport {
			outcome,
			progress: work.progress(),
			failed_sop_instance_uids: work.failed_sop_instance_uids(),
		}
	}

	/// One context per SOP class of the work list. Syntaxes preferred by the device come
	/// first, then the stored encodings that need a codec, then the uncompressed defaults.
	async fn proposed_contexts(&self, partition: &Partition, device: &Device, work: &WorkList) -> Vec<ProposedContext> {
		let preferred = match self.preferred.preferred_syntaxes(device.key).await {
			Ok(preferred) => preferred,
			Err(err) => {
				warn!(ae_title = %device.ae_title, "Failed to load preferred transfer syntaxes: {err}");
				Vec::new()
			}
		};
		let defaults: &[&str] = if partition.implicit_only {
			&[uids::IMPLICIT_VR_LITTLE_ENDIAN]
		} else {
			&[uids::EXPLICIT_VR_LITTLE_ENDIAN, uids::IMPLICIT_VR_LITTLE_ENDIAN]
		};

		let mut contexts: Vec<ProposedContext> = Vec::new();
		for instance in work.instances() {
			let index = match contexts
				.iter()
				.position(|context| context.abstract_syntax == instance.sop_class_uid)
			{
				Some(index) => index,
				None => {
					let transfer_syntaxes = preferred
						.iter()
						.filter(|syntax| syntax.sop_class_uid == instance.sop_class_uid)
						.map(|syntax| syntax.transfer_syntax_uid.clone())
						.collect();
					contexts.push(ProposedContext {
						abstract_syntax: instance.sop_class_uid.clone(),
						transfer_syntaxes,
					});
					contexts.len() - 1
				}
			};
			let transfer_syntaxes = &mut contexts[index].transfer_syntaxes;
			if !is_native(&instance.transfer_syntax_uid) && !transfer_syntaxes.contains(&instance.transfer_syntax_uid) {
				transfer_syntaxes.push(instance.transfer_syntax_uid.clone());
			}
		}
		for context in &mut contexts {
			for default in defaults {
				if !context.transfer_syntaxes.iter().any(|syntax| syntax == default) {
					context.transfer_syntaxes.push(UI::from(*default));
				}
			}
		}
		contexts
	}

	#[instrument(skip_all, fields(destination = %request.target.device.ae_title, instances = request.work.len()))]
	pub async fn forward(
		&self,
		request: ForwardRequest,
		listener: &mut dyn ProgressListener,
		cancel: &CancellationToken,
	) -> ForwardReport {
		let ForwardRequest {
			partition,
			target,
			originator,
			mut work,
		} = request;
		let _permit = match self.throttle.acquire(&target.device, self.queue_timeout, cancel).await {
			Ok(permit) => permit,
			Err(ThrottleError::Cancelled) => {
				info!("Forwarding cancelled while waiting for a free association");
				return Self::abandoned(ForwardOutcome::Cancelled, work, "Cancelled");
			}
			Err(ThrottleError::TimedOut) => {
				warn!("No free association to move destination within {:?}", self.queue_timeout);
				return Self::abandoned(
					ForwardOutcome::Unavailable,
					work,
					"Timed out waiting for a free association",
				);
			}
		};
		let contexts = self.proposed_contexts(&partition, &target.device, &work).await;

		let connect = tokio::time::timeout(
			self.connect_timeout,
			self.connector.connect(&partition.ae_title, &target, contexts),
		);
		let connected = tokio::select! {
			() = cancel.cancelled() => {
				info!("Forwarding cancelled while connecting");
				return Self::abandoned(ForwardOutcome::Cancelled, work, "Cancelled");
			}
			connected = connect => connected,
		};
		let mut sender = match connected {
			Ok(Ok(sender)) => sender,
			Ok(Err(err)) => {
				warn!(address = %target.address, "Failed to connect to move destination: {err}");
				return Self::abandoned(ForwardOutcome::ConnectFailed, work, &err.to_string());
			}
			Err(_) => {
				warn!(address = %target.address, "Timed out connecting to move destination");
				return Self::abandoned(
					ForwardOutcome::ConnectFailed,
					work,
					"Timed out connecting to move destination",
				);
			}
		};

		let mut outcome = ForwardOutcome::Completed;
		for index in 0..work.len() {
			if cancel.is_cancelled() {
				info!("Forwarding cancelled");
				outcome = ForwardOutcome::Cancelled;
				break;
			}
			let instance = &work.instances()[index];
			let progress = match sender.send(instance, originator.as_ref()).await {
				Ok(status) => {
					debug!(sop_instance_uid = %instance.sop_instance_uid, status, "Forwarded instance");
					let description = (SendStatus::from_status(status) == SendStatus::Failure)
						.then(|| format!("C-STORE-RSP status {status:#06X}"));
					work.record(index, SendStatus::from_status(status), description)
				}
				Err(err) if err.is_transport() => {
					warn!(sop_instance_uid = %instance.sop_instance_uid, "Lost move destination: {err}");
					let description = err.to_string();
					work.record(index, SendStatus::Failure, Some(description.clone()));
					work.fail_remaining(&description);
					break;
				}
				Err(err) => {
					warn!(sop_instance_uid = %instance.sop_instance_uid, "Failed to forward instance: {err}");
					work.record(index, SendStatus::Failure, Some(err.to_string()))
				}
			};
			if should_report(progress) {
				listener.pending(progress).await;
			}
		}

		sender.release().await;
		ForwardReport {
			outcome,
			progress: work.progress(),
			failed_sop_instance_uids: work.failed_sop_instance_uids(),
		}
	}
}
