//! C-MOVE service class provider.
//!
//! The requested level is resolved into a [`WorkList`] from the study descriptors of the
//! readable studies, which the [`Forwarder`] then sends to the move destination. Nearline
//! studies do not fail the request; their restore is queued and the remaining studies
//! are still sent.

use super::query::requested_level;
use super::{
	permits, AssociationContext, PresentationVerdict, ResponseWriter, ScpRequest,
	ServiceClassProvider, ServiceType,
};
use crate::audit;
use crate::descriptor::{instance_path, DescriptorStore};
use crate::dimse::cmove::{CompositeMoveRequest, CompositeMoveResponse, COMMAND_FIELD_COMPOSITE_MOVE_REQUEST};
use crate::dimse::{get_multi_str, get_str, status, WriteError};
use crate::forward::{
	final_status, ForwardRequest, ForwardTarget, Forwarder, MoveOriginator, Progress, ProgressListener,
	StorageInstance, WorkList,
};
use crate::store::criteria::{Condition, StudyCriteria, StudyField};
use crate::store::{Device, DeviceStore, LocateError, Partition, QueueState, StudyIndex, StudyLocator};
use crate::types::{QueryInformationModel, QueryRetrieveLevel, UI, US};
use async_trait::async_trait;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use futures::TryStreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// What a C-MOVE identifier selects.
#[derive(Debug, Default, PartialEq, Eq)]
struct Selection {
	study_instance_uids: Vec<UI>,
	series_instance_uids: Option<Vec<UI>>,
	sop_instance_uids: Option<Vec<UI>>,
}

/// The instances to send, and whether any selected study could not be read.
#[derive(Debug, Default)]
struct Resolution {
	work: WorkList,
	nearline: bool,
	comment: Option<String>,
}

/// Writes the responses of one C-MOVE and remembers whether the final one was sent.
struct MoveResponder {
	writer: Arc<dyn ResponseWriter>,
	presentation_context_id: Option<u8>,
	message_id: US,
	sop_class_uid: UI,
	last: Progress,
	final_sent: bool,
}

impl MoveResponder {
	async fn respond(
		&mut self,
		status: US,
		progress: Progress,
		failed_sop_instance_uids: Vec<UI>,
		comment: Option<String>,
	) -> Result<(), WriteError> {
		let mut response = CompositeMoveResponse::new(self.message_id, self.sop_class_uid.as_str(), status)
			.sub_operations(progress.into())
			.failed_sop_instance_uids(failed_sop_instance_uids);
		if let Some(comment) = comment {
			response = response.error_comment(comment);
		}
		self.last = progress;
		self.final_sent = true;
		self.writer
			.write(response.into(), self.presentation_context_id)
			.await
	}
}

#[async_trait]
impl ProgressListener for MoveResponder {
	async fn pending(&mut self, progress: Progress) {
		self.last = progress;
		let response = CompositeMoveResponse::new(self.message_id, self.sop_class_uid.as_str(), status::PENDING)
			.sub_operations(progress.into());
		if let Err(err) = self
			.writer
			.write(response.into(), self.presentation_context_id)
			.await
		{
			warn!("Failed to send pending C-MOVE-RSP: {err}");
		}
	}
}

pub struct MoveServiceProvider {
	devices: Arc<dyn DeviceStore>,
	index: Arc<dyn StudyIndex>,
	locator: Arc<dyn StudyLocator>,
	descriptors: Arc<dyn DescriptorStore>,
	forwarder: Arc<Forwarder>,
}

impl MoveServiceProvider {
	pub fn new(
		devices: Arc<dyn DeviceStore>,
		index: Arc<dyn StudyIndex>,
		locator: Arc<dyn StudyLocator>,
		descriptors: Arc<dyn DescriptorStore>,
		forwarder: Arc<Forwarder>,
	) -> Self {
		Self {
			devices,
			index,
			locator,
			descriptors,
			forwarder,
		}
	}

	/// Looks up the move destination. DHCP devices calling for themselves are reached
	/// at the address of the requesting association.
	async fn destination(
		&self,
		context: &AssociationContext,
		ae_title: &str,
	) -> anyhow::Result<Option<ForwardTarget>> {
		let Some(device) = self
			.devices
			.find_device(&context.partition.ae_title, ae_title)
			.await?
			.filter(|device| device.enabled)
		else {
			return Ok(None);
		};
		let ip = if device.dhcp && device.ae_title == context.calling_ae {
			Some(context.remote.ip())
		} else {
			device.ip_address
		};
		Ok(ip.map(|ip| ForwardTarget {
			address: SocketAddr::new(ip, device.port),
			device,
		}))
	}

	async fn select(
		&self,
		partition: &Partition,
		level: QueryRetrieveLevel,
		identifier: &InMemDicomObject,
	) -> Result<Selection, String> {
		let study_instance_uids = get_multi_str(identifier, tags::STUDY_INSTANCE_UID);
		let required = |uids: Vec<UI>, name: &str| {
			if uids.is_empty() {
				Err(format!("{name} is required for {level} level retrieves"))
			} else {
				Ok(uids)
			}
		};

		match level {
			QueryRetrieveLevel::Patient => {
				let patient_ids = required(get_multi_str(identifier, tags::PATIENT_ID), "PatientID")?;
				let criteria = StudyCriteria {
					conditions: Condition::from_values(patient_ids)
						.map(|condition| vec![(StudyField::PatientId, condition)])
						.unwrap_or_default(),
					excluded_queue_states: vec![QueueState::DeleteScheduled, QueueState::EditScheduled],
					..StudyCriteria::default()
				};
				let studies: Vec<_> = self
					.index
					.find_studies(&partition.ae_title, criteria)
					.await
					.map_err(|err| err.to_string())?
					.try_collect()
					.await
					.map_err(|err| err.to_string())?;
				Ok(Selection {
					study_instance_uids: studies
						.into_iter()
						.map(|study| study.study_instance_uid)
						.collect(),
					..Selection::default()
				})
			}
			QueryRetrieveLevel::Study => Ok(Selection {
				study_instance_uids: required(study_instance_uids, "StudyInstanceUID")?,
				..Selection::default()
			}),
			QueryRetrieveLevel::Series => Ok(Selection {
				study_instance_uids: required(study_instance_uids, "StudyInstanceUID")?,
				series_instance_uids: Some(required(
					get_multi_str(identifier, tags::SERIES_INSTANCE_UID),
					"SeriesInstanceUID",
				)?),
				sop_instance_uids: None,
			}),
			QueryRetrieveLevel::Image => Ok(Selection {
				study_instance_uids: required(study_instance_uids, "StudyInstanceUID")?,
				series_instance_uids: get_str(identifier, tags::SERIES_INSTANCE_UID).map(|uid| vec![uid]),
				sop_instance_uids: Some(required(
					get_multi_str(identifier, tags::SOP_INSTANCE_UID),
					"SOPInstanceUID",
				)?),
			}),
		}
	}

	async fn resolve(&self, partition: &Partition, selection: &Selection) -> anyhow::Result<Resolution> {
		let mut resolution = Resolution::default();
		for study_instance_uid in &selection.study_instance_uids {
			let location = match self
				.locator
				.readable_location(partition, study_instance_uid)
				.await
			{
				Ok(location) => location,
				Err(LocateError::Nearline {
					restore_requested, ..
				}) => {
					let comment = if restore_requested {
						format!("Study is nearline, inserted restore request: {study_instance_uid}")
					} else {
						format!("Study is nearline: {study_instance_uid}")
					};
					info!("{comment}");
					resolution.nearline = true;
					resolution.comment = Some(comment);
					continue;
				}
				Err(LocateError::NotFound(_)) => {
					debug!(study_instance_uid, "Study not found, skipping");
					continue;
				}
				Err(err) => {
					warn!(study_instance_uid, "Failed to locate study: {err}");
					resolution.nearline = true;
					resolution.comment = Some(format!("Failed to locate study: {err}"));
					continue;
				}
			};

			let descriptors = Arc::clone(&self.descriptors);
			let folder = location.path.clone();
			let descriptor = tokio::task::spawn_blocking(move || descriptors.load(&location)).await??;
			for series in descriptor.series() {
				if selection
					.series_instance_uids
					.as_ref()
					.is_some_and(|uids| !uids.contains(&series.series_instance_uid))
				{
					continue;
				}
				for instance in series.instances() {
					if selection
						.sop_instance_uids
						.as_ref()
						.is_some_and(|uids| !uids.contains(&instance.sop_instance_uid))
					{
						continue;
					}
					resolution.work.push(StorageInstance::new(
						instance_path(&folder, &series.series_instance_uid, &instance.sop_instance_uid),
						instance.sop_class_uid.as_str(),
						instance.sop_instance_uid.as_str(),
						instance.transfer_syntax_uid.as_str(),
					));
				}
			}
		}
		Ok(resolution)
	}

	async fn retrieve(
		&self,
		context: &AssociationContext,
		request: CompositeMoveRequest,
		responder: &mut MoveResponder,
		cancel: &tokio_util::sync::CancellationToken,
	) -> anyhow::Result<()> {
		let Some(target) = self.destination(context, &request.destination).await? else {
			let comment = format!(
				"Unknown move destination \"{}\", failing C-MOVE-RQ from {} to {}",
				request.destination, context.calling_ae, context.called_ae
			);
			warn!("{comment}");
			audit::retrieve(context, &request.destination, status::MOVE_DESTINATION_UNKNOWN, Progress::default());
			responder
				.respond(status::MOVE_DESTINATION_UNKNOWN, Progress::default(), Vec::new(), Some(comment))
				.await?;
			return Ok(());
		};

		let selection = match requested_level(&request.affected_sop_class_uid, &request.identifier) {
			Ok((_, level)) => self.select(&context.partition, level, &request.identifier).await,
			Err(comment) => Err(comment),
		};
		let selection = match selection {
			Ok(selection) => selection,
			Err(comment) => {
				warn!("Rejected C-MOVE-RQ: {comment}");
				audit::retrieve(
					context,
					&request.destination,
					status::IDENTIFIER_DOES_NOT_MATCH_SOP_CLASS,
					Progress::default(),
				);
				responder
					.respond(status::IDENTIFIER_DOES_NOT_MATCH_SOP_CLASS, Progress::default(), Vec::new(), Some(comment))
					.await?;
				return Ok(());
			}
		};

		let Resolution {
			work,
			nearline,
			comment,
		} = self.resolve(&context.partition, &selection).await?;
		if work.is_empty() {
			let status = if nearline {
				status::UNABLE_TO_PERFORM_SUBOPERATIONS
			} else {
				status::SUCCESS
			};
			debug!(status, "No instances to forward");
			audit::retrieve(context, &request.destination, status, Progress::default());
			responder.respond(status, Progress::default(), Vec::new(), None).await?;
			return Ok(());
		}

		info!(
			destination = %request.destination,
			instances = work.len(),
			studies = selection.study_instance_uids.len(),
			"Forwarding instances"
		);
		responder.last = work.progress();
		let report = self
			.forwarder
			.forward(
				ForwardRequest {
					partition: context.partition.clone(),
					target,
					originator: Some(MoveOriginator {
						ae_title: context.calling_ae.clone(),
						message_id: request.message_id,
					}),
					work,
				},
				&mut *responder,
				cancel,
			)
			.await;

		let status = final_status(report.outcome, report.progress, nearline);
		// Only the warning status explains the unreadable studies.
		let comment = if status == status::SUB_OPERATIONS_ONE_OR_MORE_FAILURES { comment } else { None };
		audit::retrieve(context, &request.destination, status, report.progress);
		responder
			.respond(status, report.progress, report.failed_sop_instance_uids, comment)
			.await?;
		Ok(())
	}
}

#[async_trait]
impl ServiceClassProvider for MoveServiceProvider {
	fn service_type(&self) -> ServiceType {
		ServiceType::Retrieve
	}

	fn command_fields(&self) -> &'static [US] {
		&[COMMAND_FIELD_COMPOSITE_MOVE_REQUEST]
	}

	fn supported_sop_classes(&self, _partition: &Partition) -> Vec<UI> {
		[QueryInformationModel::Study, QueryInformationModel::Patient]
			.iter()
			.map(|model| UI::from(model.move_sop_class()))
			.collect()
	}

	fn verify_presentation_context(
		&self,
		_partition: &Partition,
		device: Option<&Device>,
		_abstract_syntax: &str,
	) -> PresentationVerdict {
		if permits(device, ServiceType::Retrieve) {
			PresentationVerdict::Accept
		} else {
			PresentationVerdict::RejectUser
		}
	}

	#[instrument(skip_all, fields(calling_ae = %request.context.calling_ae))]
	async fn on_receive_request(&self, request: ScpRequest) -> anyhow::Result<()> {
		let ScpRequest {
			context,
			message,
			writer,
			cancel,
		} = request;
		let presentation_context_id = message.presentation_context_id;
		let request = CompositeMoveRequest::try_from(message)?;
		let mut responder = MoveResponder {
			writer,
			presentation_context_id,
			message_id: request.message_id,
			sop_class_uid: request.affected_sop_class_uid.clone(),
			last: Progress::default(),
			final_sent: false,
		};
		let destination = request.destination.clone();

		let result = self.retrieve(&context, request, &mut responder, &cancel).await;
		if responder.final_sent {
			return result;
		}

		let last = responder.last;
		match result {
			Ok(()) => {
				let progress = Progress {
					remaining: 0,
					failed: last.failed + last.remaining,
					..last
				};
				responder
					.respond(status::SUB_OPERATIONS_ONE_OR_MORE_FAILURES, progress, Vec::new(), None)
					.await?;
				Ok(())
			}
			Err(err) => {
				warn!("Unexpected failure while processing C-MOVE-RQ: {err:#}");
				audit::retrieve(&context, &destination, status::UNABLE_TO_PROCESS, last);
				responder
					.respond(status::UNABLE_TO_PROCESS, last, Vec::new(), Some(err.to_string()))
					.await?;
				Ok(())
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::descriptor::{InstanceDescriptor, JsonDescriptorStore, StudyDescriptor};
	use crate::device::tests::device;
	use crate::dimse::{get_int, DicomMessage};
	use crate::forward::tests::ScriptedConnector;
	use crate::scp::tests::{association, RecordingWriter};
	use crate::store::{IndexEntry, JsonStore, Patient, Series, Study, StudyLocation, StudyStatus};
	use dicom::core::{DataElement, VR};
	use dicom::dicom_value;
	use dicom::dictionary_std::uids;
	use std::collections::{BTreeMap, HashMap};
	use std::path::Path;
	use std::sync::Mutex;
	use std::time::Duration;
	use tokio_util::sync::CancellationToken;

	const STUDY_MOVE: &str = uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE;

	fn entry(study_uid: &str) -> IndexEntry {
		IndexEntry {
			patient: Patient {
				patient_id: String::from("PAT-1"),
				..Patient::default()
			},
			study: Study {
				study_instance_uid: UI::from(study_uid),
				patient_id: String::from("PAT-1"),
				..Study::default()
			},
			series: Series {
				series_instance_uid: format!("{study_uid}.1"),
				modality: String::from("CT"),
				..Series::default()
			},
			sop_instance_uid: format!("{study_uid}.1.1"),
		}
	}

	fn write_descriptor(root: &Path, study_uid: &str, instances: usize) {
		let mut descriptor = StudyDescriptor::new(study_uid);
		for index in 0..instances {
			descriptor.add_file(
				&format!("{study_uid}.1"),
				InstanceDescriptor {
					sop_instance_uid: format!("{study_uid}.1.{index}"),
					sop_class_uid: UI::from("1.2.840.10008.5.1.4.1.1.2"),
					transfer_syntax_uid: UI::from(uids::EXPLICIT_VR_LITTLE_ENDIAN),
					file_size: 0,
					attributes: BTreeMap::new(),
				},
			);
		}
		let location = StudyLocation {
			study_instance_uid: UI::from(study_uid),
			path: root.join(study_uid),
		};
		let path = JsonDescriptorStore.path(&location);
		std::fs::create_dir_all(&location.path).unwrap();
		std::fs::write(path, JsonDescriptorStore.encode(&descriptor).unwrap()).unwrap();
	}

	struct Fixture {
		provider: MoveServiceProvider,
		sent: Arc<Mutex<Vec<UI>>>,
		root: tempfile::TempDir,
	}

	async fn fixture() -> Fixture {
		fixture_with(ScriptedConnector::default()).await
	}

	async fn fixture_with(connector: ScriptedConnector) -> Fixture {
		let root = tempfile::tempdir().unwrap();
		let store = Arc::new(JsonStore::in_memory(Vec::new()));
		store.insert_device(device("VIEWER", false)).await.unwrap();
		for study_uid in ["1.1", "1.2"] {
			store.record_instance("ARCHIVE", entry(study_uid)).await.unwrap();
		}
		store
			.set_study_status("ARCHIVE", "1.2", StudyStatus::Nearline)
			.await
			.unwrap();
		write_descriptor(root.path(), "1.1", 3);

		let sent = Arc::clone(&connector.sent);
		let forwarder = Forwarder::new(
			Arc::new(connector),
			Arc::clone(&store) as _,
			Duration::from_secs(5),
			Duration::from_secs(5),
		);
		let provider = MoveServiceProvider::new(
			Arc::clone(&store) as _,
			Arc::clone(&store) as _,
			store,
			Arc::new(JsonDescriptorStore),
			Arc::new(forwarder),
		);
		Fixture { provider, sent, root }
	}

	fn move_request(destination: &str, study_uids: &str) -> DicomMessage {
		let request = CompositeMoveRequest {
			identifier: InMemDicomObject::from_element_iter([
				DataElement::new(tags::QUERY_RETRIEVE_LEVEL, VR::CS, dicom_value!(Str, "STUDY")),
				DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, study_uids)),
			]),
			message_id: 11,
			priority: 0,
			affected_sop_class_uid: UI::from(STUDY_MOVE),
			destination: UI::from(destination),
		};
		let mut message: DicomMessage = request.into();
		message.presentation_context_id = Some(1);
		message
	}

	async fn run(fixture: &Fixture, message: DicomMessage) -> Arc<RecordingWriter> {
		run_until(fixture, message, CancellationToken::new()).await
	}

	async fn run_until(fixture: &Fixture, message: DicomMessage, cancel: CancellationToken) -> Arc<RecordingWriter> {
		let writer = Arc::new(RecordingWriter::default());
		let mut context = association(None, Vec::new());
		context.partition.root = fixture.root.path().to_path_buf();
		fixture
			.provider
			.on_receive_request(ScpRequest {
				context: Arc::new(context),
				message,
				writer: Arc::clone(&writer) as Arc<dyn ResponseWriter>,
				cancel,
			})
			.await
			.unwrap();
		writer
	}

	#[tokio::test]
	async fn readable_instances_are_forwarded_next_to_nearline_studies() {
		let fixture = fixture().await;
		let writer = run(&fixture, move_request("VIEWER", "1.1\\1.2")).await;

		assert_eq!(fixture.sent.lock().unwrap().len(), 3);
		assert_eq!(writer.statuses(), vec![status::UNABLE_TO_PERFORM_SUBOPERATIONS]);
		assert_eq!(writer.int(0, tags::NUMBER_OF_COMPLETED_SUBOPERATIONS), Some(3));
		assert_eq!(writer.int(0, tags::NUMBER_OF_FAILED_SUBOPERATIONS), Some(0));
		assert_eq!(get_str(&writer.take()[0].command, tags::ERROR_COMMENT), None);
	}

	#[tokio::test]
	async fn cancel_during_transfer_reports_the_unsent_instances() {
		let cancel = CancellationToken::new();
		let fixture = fixture_with(ScriptedConnector {
			cancel_on_send: Some(cancel.clone()),
			..ScriptedConnector::default()
		})
		.await;
		let writer = run_until(&fixture, move_request("VIEWER", "1.1"), cancel).await;

		assert_eq!(fixture.sent.lock().unwrap().len(), 1);
		assert_eq!(writer.statuses(), vec![status::CANCEL]);
		assert_eq!(writer.int(0, tags::STATUS), Some(0xFE00));
		assert_eq!(writer.int(0, tags::NUMBER_OF_REMAINING_SUBOPERATIONS), Some(2));
		assert_eq!(writer.int(0, tags::NUMBER_OF_COMPLETED_SUBOPERATIONS), Some(1));
		assert_eq!(writer.int(0, tags::NUMBER_OF_FAILED_SUBOPERATIONS), Some(0));
	}

	#[tokio::test]
	async fn failed_sub_operations_carry_the_nearline_comment() {
		let fixture = fixture_with(ScriptedConnector {
			statuses: HashMap::from([(UI::from("1.1.1.0"), status::OUT_OF_RESOURCES)]),
			..ScriptedConnector::default()
		})
		.await;
		let writer = run(&fixture, move_request("VIEWER", "1.1\\1.2")).await;

		assert_eq!(writer.statuses(), vec![status::SUB_OPERATIONS_ONE_OR_MORE_FAILURES]);
		assert_eq!(writer.int(0, tags::NUMBER_OF_FAILED_SUBOPERATIONS), Some(1));
		assert!(get_str(&writer.take()[0].command, tags::ERROR_COMMENT).is_some());
	}

	#[tokio::test]
	async fn only_nearline_studies_are_refused_without_sub_operations() {
		let fixture = fixture().await;
		let writer = run(&fixture, move_request("VIEWER", "1.2")).await;

		assert!(fixture.sent.lock().unwrap().is_empty());
		assert_eq!(writer.statuses(), vec![status::UNABLE_TO_PERFORM_SUBOPERATIONS]);
		assert_eq!(writer.int(0, tags::NUMBER_OF_COMPLETED_SUBOPERATIONS), Some(0));
	}

	#[tokio::test]
	async fn unknown_study_completes_without_sub_operations() {
		let fixture = fixture().await;
		let writer = run(&fixture, move_request("VIEWER", "9.9")).await;
		assert_eq!(writer.statuses(), vec![status::SUCCESS]);

		let missing = StudyLocation {
			study_instance_uid: UI::from("1.1"),
			path: fixture.root.path().join("1.1"),
		};
		std::fs::remove_file(JsonDescriptorStore.path(&missing)).unwrap();
		let writer = run(&fixture, move_request("VIEWER", "1.1")).await;
		assert_eq!(writer.statuses(), vec![status::SUCCESS]);
		assert_eq!(writer.int(0, tags::NUMBER_OF_REMAINING_SUBOPERATIONS), Some(0));
	}

	#[tokio::test]
	async fn unknown_destination_is_refused() {
		let fixture = fixture().await;
		let writer = run(&fixture, move_request("NOWHERE", "1.1")).await;
		assert_eq!(writer.statuses(), vec![status::MOVE_DESTINATION_UNKNOWN]);
		assert!(fixture.sent.lock().unwrap().is_empty());
		assert_eq!(get_int(&writer.take()[0].command, tags::MESSAGE_ID_BEING_RESPONDED_TO), Some(11));
	}

	#[tokio::test]
	async fn dhcp_destination_calling_for_itself_uses_the_remote_address() {
		let fixture = fixture().await;
		let mut context = association(Some(device("LAPTOP", true)), Vec::new());
		let mut laptop = device("LAPTOP", true);
		laptop.ip_address = None;
		fixture.provider.devices.insert_device(laptop).await.unwrap();

		let target = fixture
			.provider
			.destination(&context, "LAPTOP")
			.await
			.unwrap()
			.expect("destination");
		assert_eq!(target.address, SocketAddr::new(context.remote.ip(), 104));

		context.calling_ae = UI::from("OTHER");
		assert!(fixture.provider.destination(&context, "LAPTOP").await.unwrap().is_none());
	}
}
