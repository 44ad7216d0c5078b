//! Service class providers behind the DICOM listener.
//! - [`ServiceRegistry`] maps each [`ServiceType`] to its provider.
//! - [`negotiation`] judges the presentation contexts of an accepted association.
//! - [`server`] runs the listener and dispatches messages to the providers.

pub mod echo;
pub mod negotiation;
pub mod query;
pub mod retrieve;
pub mod server;
pub mod store;

use crate::dimse::{DicomMessage, WriteError};
use crate::store::{Device, Partition};
use crate::types::{AE, UI, US};
use async_trait::async_trait;
use dicom::object::InMemDicomObject;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServiceType {
	Verification,
	Storage,
	Query,
	Retrieve,
}

impl ServiceType {
	/// Find and move operations run next to the association loop so that a
	/// C-CANCEL-RQ can still be read.
	pub const fn is_long_running(self) -> bool {
		matches!(self, Self::Query | Self::Retrieve)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationVerdict {
	Accept,
	/// The device lacks the permission for the service.
	RejectUser,
	/// No provider advertises the abstract syntax.
	RejectAbstractSyntax,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationState {
	Idle,
	Negotiating,
	Active,
	Closed,
}

#[derive(Debug, Error)]
#[error("Illegal association state transition from {from:?} to {to:?}")]
pub struct TransitionError {
	pub from: AssociationState,
	pub to: AssociationState,
}

impl AssociationState {
	pub const fn transition(self, to: Self) -> Result<Self, TransitionError> {
		match (self, to) {
			(Self::Idle, Self::Negotiating)
			| (Self::Negotiating, Self::Active)
			| (Self::Idle | Self::Negotiating | Self::Active, Self::Closed) => Ok(to),
			(from, to) => Err(TransitionError { from, to }),
		}
	}
}

/// A presentation context accepted during establishment, together with our verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedContext {
	pub id: u8,
	pub abstract_syntax: UI,
	pub transfer_syntax: UI,
	pub verdict: PresentationVerdict,
}

/// Everything the providers know about the association a request arrived on.
#[derive(Debug, Clone)]
pub struct AssociationContext {
	pub id: Uuid,
	pub calling_ae: AE,
	pub called_ae: AE,
	pub remote: SocketAddr,
	pub partition: Partition,
	/// `None` for callers of a partition that accepts unknown devices.
	pub device: Option<Device>,
	pub presentation_contexts: Vec<NegotiatedContext>,
	/// Groups the instances received on this association.
	pub batch_id: String,
}

impl AssociationContext {
	pub fn presentation_context(&self, id: Option<u8>) -> Option<&NegotiatedContext> {
		let id = id?;
		self.presentation_contexts
			.iter()
			.find(|context| context.id == id)
	}

	pub fn verdict(&self, id: Option<u8>) -> PresentationVerdict {
		self.presentation_context(id)
			.map_or(PresentationVerdict::RejectAbstractSyntax, |context| {
				context.verdict
			})
	}
}

/// Sends responses on the association a request arrived on.
#[async_trait]
pub trait ResponseWriter: Send + Sync {
	async fn write(
		&self,
		message: DicomMessage,
		presentation_context_id: Option<u8>,
	) -> Result<(), WriteError>;
}

/// A request dispatched to a provider.
pub struct ScpRequest {
	pub context: Arc<AssociationContext>,
	pub message: DicomMessage,
	pub writer: Arc<dyn ResponseWriter>,
	/// Fired when the peer sends a C-CANCEL-RQ for this request or the association ends.
	pub cancel: CancellationToken,
}

#[async_trait]
pub trait ServiceClassProvider: Send + Sync {
	fn service_type(&self) -> ServiceType;

	/// Command fields of the requests handled by this provider.
	fn command_fields(&self) -> &'static [US];

	/// Abstract syntaxes advertised for associations to the given partition.
	fn supported_sop_classes(&self, partition: &Partition) -> Vec<UI>;

	fn verify_presentation_context(
		&self,
		partition: &Partition,
		device: Option<&Device>,
		abstract_syntax: &str,
	) -> PresentationVerdict;

	/// Receives the data set of a request straight into the returned file.
	fn spool_target(
		&self,
		_context: &AssociationContext,
		_command: &InMemDicomObject,
	) -> Option<PathBuf> {
		None
	}

	async fn on_receive_request(&self, request: ScpRequest) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct ServiceRegistry {
	providers: BTreeMap<ServiceType, Arc<dyn ServiceClassProvider>>,
}

impl ServiceRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a provider, replacing a previous one of the same service type.
	pub fn register(&mut self, provider: Arc<dyn ServiceClassProvider>) {
		self.providers.insert(provider.service_type(), provider);
	}

	pub fn get(&self, service_type: ServiceType) -> Option<&Arc<dyn ServiceClassProvider>> {
		self.providers.get(&service_type)
	}

	pub fn providers(&self) -> impl Iterator<Item = &Arc<dyn ServiceClassProvider>> {
		self.providers.values()
	}

	pub fn is_empty(&self) -> bool {
		self.providers.is_empty()
	}

	pub fn for_command(&self, command_field: US) -> Option<&Arc<dyn ServiceClassProvider>> {
		self.providers()
			.find(|provider| provider.command_fields().contains(&command_field))
	}

	pub fn for_abstract_syntax(
		&self,
		partition: &Partition,
		abstract_syntax: &str,
	) -> Option<&Arc<dyn ServiceClassProvider>> {
		self.providers().find(|provider| {
			provider
				.supported_sop_classes(partition)
				.iter()
				.any(|uid| uid == abstract_syntax)
		})
	}

	/// Union of the abstract syntaxes advertised for any of the partitions.
	pub fn abstract_syntaxes(&self, partitions: &[Partition]) -> Vec<UI> {
		let mut syntaxes: Vec<UI> = partitions
			.iter()
			.flat_map(|partition| {
				self.providers()
					.flat_map(move |provider| provider.supported_sop_classes(partition))
			})
			.collect();
		syntaxes.sort_unstable();
		syntaxes.dedup();
		syntaxes
	}
}

/// Whether a device may use a service. Unknown devices of an open partition may use all.
pub fn permits(device: Option<&Device>, service_type: ServiceType) -> bool {
	device.is_none_or(|device| match service_type {
		ServiceType::Verification => true,
		ServiceType::Storage => device.allow_storage,
		ServiceType::Query => device.allow_query,
		ServiceType::Retrieve => device.allow_retrieve,
	})
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use crate::device::tests::{device, partition};
	use crate::dimse::get_int;
	use crate::import::{ImportRequest, ImportSource, Importer, ProcessingResult};
	use crate::store::DuplicatePolicy;
	use std::net::{IpAddr, Ipv4Addr};
	use std::sync::Mutex;

	/// Collects every response instead of writing it to an association.
	#[derive(Default)]
	pub struct RecordingWriter {
		messages: Mutex<Vec<DicomMessage>>,
	}

	impl RecordingWriter {
		pub fn statuses(&self) -> Vec<US> {
			self.messages
				.lock()
				.unwrap()
				.iter()
				.filter_map(DicomMessage::status)
				.collect()
		}

		pub fn int(&self, index: usize, tag: dicom::core::Tag) -> Option<US> {
			self.messages
				.lock()
				.unwrap()
				.get(index)
				.and_then(|message| get_int(&message.command, tag))
		}

		pub fn take(&self) -> Vec<DicomMessage> {
			std::mem::take(&mut *self.messages.lock().unwrap())
		}

		pub fn len(&self) -> usize {
			self.messages.lock().unwrap().len()
		}
	}

	#[async_trait]
	impl ResponseWriter for RecordingWriter {
		async fn write(
			&self,
			message: DicomMessage,
			_presentation_context_id: Option<u8>,
		) -> Result<(), WriteError> {
			self.messages.lock().unwrap().push(message);
			Ok(())
		}
	}

	/// What the storage provider handed to the importer.
	#[derive(Debug, Clone, PartialEq, Eq)]
	pub struct ImportCall {
		pub source_ae: AE,
		pub batch_id: String,
		pub duplicate_override: Option<DuplicatePolicy>,
		pub from_file: bool,
	}

	#[derive(Default)]
	pub struct ImportDouble {
		pub calls: Mutex<Vec<ImportCall>>,
		pub failure: Option<(US, String)>,
	}

	#[async_trait]
	impl Importer for ImportDouble {
		async fn import(&self, request: ImportRequest) -> ProcessingResult {
			self.calls.lock().unwrap().push(ImportCall {
				source_ae: request.source_ae,
				batch_id: request.batch_id,
				duplicate_override: request.duplicate_override,
				from_file: matches!(request.source, ImportSource::File(_)),
			});
			let (successful, status, error_message) = match &self.failure {
				Some((status, message)) => (false, *status, Some(message.clone())),
				None => (true, crate::dimse::status::SUCCESS, None),
			};
			ProcessingResult {
				successful,
				status,
				sop_instance_uid: Some(UI::from("1.2.3.4")),
				study_instance_uid: Some(UI::from("1.2.3")),
				series_instance_uid: Some(UI::from("1.2.3.1")),
				accession_number: Some(String::from("ACC-1")),
				error_message,
			}
		}
	}

	pub fn association(device: Option<Device>, contexts: Vec<NegotiatedContext>) -> AssociationContext {
		AssociationContext {
			id: Uuid::new_v4(),
			calling_ae: device
				.as_ref()
				.map_or_else(|| AE::from("ANY"), |device| device.ae_title.clone()),
			called_ae: AE::from("ARCHIVE"),
			remote: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 50000),
			partition: partition(false),
			device,
			presentation_contexts: contexts,
			batch_id: String::from("20240101120000000000"),
		}
	}

	#[test]
	fn state_machine() {
		let state = AssociationState::Idle;
		let state = state.transition(AssociationState::Negotiating).unwrap();
		let state = state.transition(AssociationState::Active).unwrap();
		assert!(state.transition(AssociationState::Negotiating).is_err());
		let state = state.transition(AssociationState::Closed).unwrap();
		assert!(state.transition(AssociationState::Active).is_err());
		assert!(AssociationState::Idle
			.transition(AssociationState::Active)
			.is_err());
	}

	#[test]
	fn unknown_devices_are_permitted_everything() {
		assert!(permits(None, ServiceType::Retrieve));
		let mut restricted = device("CT1", false);
		restricted.allow_query = false;
		assert!(!permits(Some(&restricted), ServiceType::Query));
		assert!(permits(Some(&restricted), ServiceType::Storage));
	}

	#[test]
	fn unknown_presentation_context_is_rejected() {
		let context = association(None, Vec::new());
		assert_eq!(context.verdict(Some(1)), PresentationVerdict::RejectAbstractSyntax);
		assert_eq!(context.verdict(None), PresentationVerdict::RejectAbstractSyntax);
	}
}
