use super::negotiation::{negotiate, AcceptedContext};
use super::{
	AssociationContext, AssociationState, PresentationVerdict, ResponseWriter, ScpRequest,
	ServiceRegistry,
};
use crate::audit;
use crate::config::ServerConfig;
use crate::device::{AssociationVerifier, DeviceAccessControl, Verdict};
use crate::dimse::association::server::{ServerAssociation, ServerAssociationOptions};
use crate::dimse::association::Association;
use crate::dimse::ccancel::{CompositeCancelRequest, COMMAND_FIELD_COMPOSITE_CANCEL_REQUEST};
use crate::dimse::{
	failure_response, get_int, status, DicomMessage, DicomMessageReader, DicomMessageWriter,
	ReadError, WriteError,
};
use crate::store::Partition;
use crate::types::{UI, US};
use async_trait::async_trait;
use dashmap::DashMap;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use dicom::ul::pdu::PresentationContextResultReason;
use dicom::ul::Pdu;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument, Span};
use uuid::Uuid;

/// Accepts associations and dispatches their requests to the registered providers.
pub struct DicomServer {
	inner: Arc<InnerDicomServer>,
}

struct InnerDicomServer {
	config: ServerConfig,
	registry: ServiceRegistry,
	verifier: Arc<AssociationVerifier>,
	/// Advertised during establishment, before the partition of the caller is known.
	abstract_syntaxes: Vec<UI>,
	/// Bounds the find and move operations running across all associations.
	workers: Arc<Semaphore>,
}

impl InnerDicomServer {
	fn spool_target(&self, context: &AssociationContext, command: &InMemDicomObject) -> Option<PathBuf> {
		let command_field = get_int(command, tags::COMMAND_FIELD)?;
		self.registry
			.for_command(command_field)?
			.spool_target(context, command)
	}
}

impl DicomServer {
	pub fn new(
		config: ServerConfig,
		registry: ServiceRegistry,
		verifier: Arc<AssociationVerifier>,
		partitions: &[Partition],
	) -> Self {
		let abstract_syntaxes = registry.abstract_syntaxes(partitions);
		let workers = Arc::new(Semaphore::new(config.workers.max(1)));
		Self {
			inner: Arc::new(InnerDicomServer {
				config,
				registry,
				verifier,
				abstract_syntaxes,
				workers,
			}),
		}
	}

	/// Runs the listener until `cancel` fires, then waits for the open associations.
	pub async fn spawn(&self, cancel: CancellationToken) -> anyhow::Result<()> {
		let config = &self.inner.config;
		let address = SocketAddr::from((config.interface, config.port));
		let listener = TcpListener::bind(&address).await?;
		info!(
			aet = %config.aet,
			services = self.inner.abstract_syntaxes.len(),
			"Started DICOM listener on {address}"
		);

		let associations = Arc::new(Semaphore::new(config.max_associations));
		let mut connections = JoinSet::new();
		loop {
			let accepted = tokio::select! {
				() = cancel.cancelled() => break,
				accepted = listener.accept() => accepted,
			};
			match accepted {
				Ok((stream, peer)) => {
					let Ok(permit) = Arc::clone(&associations).try_acquire_owned() else {
						warn!(%peer, "Closing connection, too many open associations");
						continue;
					};
					info!("Accepted incoming connection from {peer}");
					let span = info_span!("SCP", aet = &config.aet, peer = peer.to_string());
					let inner = Arc::clone(&self.inner);
					let cancel = cancel.child_token();
					connections.spawn(
						async move {
							if let Err(err) = Self::process(stream, peer, inner, cancel).await {
								error!("{err}");
							}
							drop(permit);
						}
						.instrument(span),
					);
				}
				Err(err) => error!("Failed to accept incoming connection: {err}"),
			}
			while connections.try_join_next().is_some() {}
		}

		info!(open = connections.len(), "Stopped DICOM listener");
		while connections.join_next().await.is_some() {}
		Ok(())
	}

	#[instrument(skip_all)]
	async fn process(
		stream: TcpStream,
		peer: SocketAddr,
		inner: Arc<InnerDicomServer>,
		cancel: CancellationToken,
	) -> anyhow::Result<()> {
		let tcp_stream = stream.into_std()?;
		// dicom-ul uses blocking reads and writes. They happen on the threads of ServerAssociation.
		tcp_stream.set_nonblocking(false)?;

		let state = AssociationState::Idle.transition(AssociationState::Negotiating)?;
		let access_control =
			DeviceAccessControl::new(Arc::clone(&inner.verifier), Handle::current(), peer.ip());
		let verdict = access_control.verdict();
		let id = Uuid::new_v4();
		let established = ServerAssociation::new(ServerAssociationOptions {
			aet: inner.config.aet.clone(),
			tcp_stream,
			uncompressed: inner.config.uncompressed,
			abstract_syntaxes: inner.abstract_syntaxes.clone(),
			access_control,
			max_pdu_length: inner.config.max_pdu_length,
			id,
		})
		.await;
		let verdict = verdict.lock().ok().and_then(|mut slot| slot.take());

		let (association, partition, device) = match (established, verdict) {
			(Ok(association), Some(Verdict::Accept { partition, device })) => {
				(association, partition, device)
			}
			(Ok(_), _) => anyhow::bail!("Association was established without being verified"),
			(Err(_), Some(Verdict::Reject { result, reason, .. })) => {
				audit::association_rejected(peer, result, reason);
				state.transition(AssociationState::Closed)?;
				return Ok(());
			}
			(Err(err), _) => {
				warn!("Failed to establish association: {err}");
				state.transition(AssociationState::Closed)?;
				return Ok(());
			}
		};

		let accepted = association
			.presentation_contexts()
			.iter()
			.filter(|context| context.reason == PresentationContextResultReason::Acceptance)
			.map(|context| AcceptedContext {
				id: context.id,
				abstract_syntax: context.abstract_syntax.clone(),
				transfer_syntax: UI::from(context.transfer_syntax.trim_end_matches('\0')),
			})
			.collect::<Vec<_>>();
		let presentation_contexts = negotiate(&inner.registry, &partition, device.as_ref(), accepted);
		let state = state.transition(AssociationState::Active)?;

		let context = Arc::new(AssociationContext {
			id,
			calling_ae: association.calling_aet().trim().to_owned(),
			called_ae: partition.ae_title.clone(),
			remote: peer,
			partition,
			device,
			presentation_contexts,
			batch_id: chrono::Local::now().format("%Y%m%d%H%M%S%6f").to_string(),
		});
		audit::association_established(&context);

		let association = Arc::new(association);
		let timeout = inner.config.timeout();
		let mut connection = Connection {
			writer: Arc::new(AssociationWriter {
				association: Arc::clone(&association),
				timeout,
			}),
			inner,
			context,
			operations: Arc::default(),
			tasks: JoinSet::new(),
			cancel,
		};
		let ending = connection.serve(&association).await;

		match ending {
			Ending::Released => {
				// Operations still running are finished before the release is confirmed.
				connection.finish().await;
				if let Err(err) = association.send(Pdu::ReleaseRP, timeout).await {
					debug!("Failed to confirm release: {err}");
				}
				info!("Released association");
			}
			Ending::Aborted => {
				connection.abort().await;
				info!("Peer aborted association");
			}
			Ending::Shutdown => {
				connection.abort().await;
				info!("Closed association on shutdown");
			}
			Ending::Failed(err) => {
				connection.abort().await;
				warn!("Closed association after error: {err}");
			}
		}
		state.transition(AssociationState::Closed)?;
		Ok(())
	}
}

enum Ending {
	Released,
	Aborted,
	Shutdown,
	Failed(anyhow::Error),
}

/// Writes responses of inline and spawned operations on the shared association.
struct AssociationWriter {
	association: Arc<ServerAssociation>,
	timeout: Duration,
}

#[async_trait]
impl ResponseWriter for AssociationWriter {
	async fn write(
		&self,
		message: DicomMessage,
		presentation_context_id: Option<u8>,
	) -> Result<(), WriteError> {
		self.association
			.write_message(message, presentation_context_id, self.timeout)
			.await
	}
}

/// State of one established association.
struct Connection {
	inner: Arc<InnerDicomServer>,
	context: Arc<AssociationContext>,
	writer: Arc<dyn ResponseWriter>,
	/// Cancellation of the running find and move operations, by message id.
	operations: Arc<DashMap<US, CancellationToken>>,
	tasks: JoinSet<()>,
	cancel: CancellationToken,
}

impl Connection {
	async fn serve(&mut self, association: &ServerAssociation) -> Ending {
		loop {
			let inner = &self.inner;
			let context = &self.context;
			let read = tokio::select! {
				() = self.cancel.cancelled() => return Ending::Shutdown,
				// Duration::MAX to indefinitely wait for incoming messages
				read = association.read_message_spooled(Duration::MAX, |command| {
					inner.spool_target(context, command)
				}) => read,
			};
			let message = match read {
				Ok(message) => message,
				Err(ReadError::Released) => return Ending::Released,
				Err(ReadError::Aborted) => return Ending::Aborted,
				Err(err) => return Ending::Failed(err.into()),
			};
			if let Err(err) = self.dispatch(message).await {
				return Ending::Failed(err.into());
			}
			while self.tasks.try_join_next().is_some() {}
		}
	}

	async fn dispatch(&mut self, message: DicomMessage) -> Result<(), WriteError> {
		let Some(command_field) = message.command_field() else {
			warn!("Ignoring message without command field");
			return Ok(());
		};

		if command_field == COMMAND_FIELD_COMPOSITE_CANCEL_REQUEST {
			self.cancel_operation(&message);
			return Ok(());
		}

		let Some(provider) = self.inner.registry.for_command(command_field).cloned() else {
			warn!(command_field, "Received unrecognized operation");
			return self
				.refuse(&message, status::UNRECOGNIZED_OPERATION, "Unrecognized operation")
				.await;
		};

		match self.context.verdict(message.presentation_context_id) {
			PresentationVerdict::Accept => {}
			PresentationVerdict::RejectUser => {
				warn!(
					calling_ae = %self.context.calling_ae,
					service = ?provider.service_type(),
					"Refused request of unauthorized device"
				);
				if let Some(file) = &message.file {
					remove_spooled(file).await;
				}
				return self
					.refuse(&message, status::REFUSED_NOT_AUTHORIZED, "Not authorized for this service")
					.await;
			}
			PresentationVerdict::RejectAbstractSyntax => {
				if let Some(file) = &message.file {
					remove_spooled(file).await;
				}
				return self
					.refuse(&message, status::SOP_CLASS_NOT_SUPPORTED, "SOP class not supported")
					.await;
			}
		}

		let cancel = self.cancel.child_token();
		let message_id = message.message_id();
		let request = ScpRequest {
			context: Arc::clone(&self.context),
			message,
			writer: Arc::clone(&self.writer),
			cancel: cancel.clone(),
		};

		if !provider.service_type().is_long_running() {
			if let Err(err) = provider.on_receive_request(request).await {
				error!("Failed to process request: {err}");
			}
			return Ok(());
		}

		if let Some(message_id) = message_id {
			self.operations.insert(message_id, cancel);
		}
		let operations = Arc::clone(&self.operations);
		let workers = Arc::clone(&self.inner.workers);
		self.tasks.spawn(
			async move {
				// The read loop stays responsive to C-CANCEL-RQ while waiting for a worker.
				if let Ok(_permit) = workers.acquire_owned().await {
					if let Err(err) = provider.on_receive_request(request).await {
						error!("Failed to process request: {err}");
					}
				}
				if let Some(message_id) = message_id {
					operations.remove(&message_id);
				}
			}
			.instrument(Span::current()),
		);
		Ok(())
	}

	fn cancel_operation(&self, message: &DicomMessage) {
		match CompositeCancelRequest::try_from(message) {
			Ok(request) => {
				let message_id = request.message_id_being_responded_to;
				match self.operations.get(&message_id) {
					Some(operation) => {
						info!(message_id, "Cancelling operation on C-CANCEL-RQ");
						operation.cancel();
					}
					None => debug!(message_id, "C-CANCEL-RQ for an operation that is not running"),
				}
			}
			Err(err) => warn!("Ignoring malformed C-CANCEL-RQ: {err}"),
		}
	}

	async fn refuse(&self, request: &DicomMessage, status: US, comment: &str) -> Result<(), WriteError> {
		match failure_response(request, status, Some(comment)) {
			Some(response) => {
				self.writer
					.write(response, request.presentation_context_id)
					.await
			}
			None => Ok(()),
		}
	}

	async fn finish(&mut self) {
		while self.tasks.join_next().await.is_some() {}
	}

	async fn abort(&mut self) {
		self.cancel.cancel();
		self.finish().await;
	}
}

/// Removes a data set spooled for a refused request, and its folder once empty.
async fn remove_spooled(file: &Path) {
	if let Err(err) = tokio::fs::remove_file(file).await {
		warn!(path = %file.display(), "Failed to remove spooled data set: {err}");
		return;
	}
	if let Some(folder) = file.parent() {
		if let Err(err) = tokio::fs::remove_dir(folder).await {
			debug!(folder = %folder.display(), "Kept spool folder: {err}");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::device::tests::{device, partition};
	use crate::device::DeviceCache;
	use crate::dimse::cecho::COMMAND_FIELD_COMPOSITE_ECHO_REQUEST;
	use crate::scp::echo::VerificationServiceProvider;
	use crate::scp::tests::{association, RecordingWriter};
	use crate::scp::NegotiatedContext;
	use crate::store::{DeviceStore, JsonStore, PartitionStore};
	use dicom::core::{DataElement, VR};
	use dicom::dicom_value;
	use dicom::dictionary_std::uids;
	use std::net::{IpAddr, Ipv4Addr};

	fn config() -> ServerConfig {
		ServerConfig {
			aet: String::from("ARCHIVE"),
			interface: IpAddr::V4(Ipv4Addr::LOCALHOST),
			port: 0,
			max_associations: 4,
			uncompressed: false,
			max_pdu_length: 16384,
			timeout: 1000,
			workers: 2,
		}
	}

	fn connection(verdict: PresentationVerdict) -> (Connection, Arc<RecordingWriter>) {
		let store = Arc::new(JsonStore::in_memory(vec![partition(false)]));
		let devices = Arc::new(DeviceCache::new(
			Arc::clone(&store) as Arc<dyn DeviceStore>,
			Duration::from_secs(150),
		));
		let verifier = Arc::new(AssociationVerifier::new(store as Arc<dyn PartitionStore>, devices));
		let mut registry = ServiceRegistry::new();
		registry.register(Arc::new(VerificationServiceProvider));
		let server = DicomServer::new(config(), registry, verifier, &[partition(false)]);

		let contexts = vec![NegotiatedContext {
			id: 1,
			abstract_syntax: UI::from(uids::VERIFICATION),
			transfer_syntax: UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN),
			verdict,
		}];
		let writer = Arc::new(RecordingWriter::default());
		let connection = Connection {
			inner: server.inner,
			context: Arc::new(association(Some(device("CT1", false)), contexts)),
			writer: Arc::clone(&writer) as Arc<dyn ResponseWriter>,
			operations: Arc::default(),
			tasks: JoinSet::new(),
			cancel: CancellationToken::new(),
		};
		(connection, writer)
	}

	fn request(command_field: US, message_id: US) -> DicomMessage {
		let mut message = DicomMessage::new(
			InMemDicomObject::command_from_element_iter([
				DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::VERIFICATION)),
				DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [command_field])),
				DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
			]),
			None,
		);
		message.presentation_context_id = Some(1);
		message
	}

	#[tokio::test]
	async fn echo_is_answered_inline() {
		let (mut connection, writer) = connection(PresentationVerdict::Accept);
		connection
			.dispatch(request(COMMAND_FIELD_COMPOSITE_ECHO_REQUEST, 1))
			.await
			.unwrap();
		assert_eq!(writer.statuses(), vec![status::SUCCESS]);
	}

	#[tokio::test]
	async fn unrecognized_operation_is_refused() {
		let (mut connection, writer) = connection(PresentationVerdict::Accept);
		// C-GET-RQ has no provider
		connection.dispatch(request(0x0010, 2)).await.unwrap();
		assert_eq!(writer.statuses(), vec![status::UNRECOGNIZED_OPERATION]);
		assert_eq!(writer.int(0, tags::COMMAND_FIELD), Some(0x8010));
	}

	#[tokio::test]
	async fn request_on_rejected_context_is_not_authorized() {
		let (mut connection, writer) = connection(PresentationVerdict::RejectUser);
		connection
			.dispatch(request(COMMAND_FIELD_COMPOSITE_ECHO_REQUEST, 3))
			.await
			.unwrap();
		assert_eq!(writer.statuses(), vec![status::REFUSED_NOT_AUTHORIZED]);
	}

	#[tokio::test]
	async fn cancel_request_cancels_the_running_operation() {
		let (mut connection, writer) = connection(PresentationVerdict::Accept);
		let operation = CancellationToken::new();
		connection.operations.insert(9, operation.clone());

		let mut cancel = DicomMessage::new(
			InMemDicomObject::command_from_element_iter([
				DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_CANCEL_REQUEST])),
				DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [9])),
			]),
			None,
		);
		cancel.presentation_context_id = Some(1);
		connection.dispatch(cancel).await.unwrap();

		assert!(operation.is_cancelled());
		assert_eq!(writer.len(), 0);
	}

	#[tokio::test]
	async fn spooled_data_set_of_refused_request_is_removed() {
		let temp = tempfile::tempdir().unwrap();
		let folder = temp.path().join("operation");
		std::fs::create_dir_all(&folder).unwrap();
		let file = folder.join("1.2.3.4.dcm");
		std::fs::write(&file, b"DICM").unwrap();

		remove_spooled(&file).await;
		assert!(!file.exists());
		assert!(!folder.exists());
	}
}
