//! C-FIND service class provider for the patient root and study root models.
//!
//! Matches are streamed from the [`StudyIndex`] (or the study descriptor at image level)
//! and answered through a [`ResponseBuffer`], which writes pending responses in batches
//! and stops at the configured maximum or when the request is cancelled.

mod buffer;
mod populate;

pub use buffer::{QueryOutcome, ResponseBuffer};

use super::{permits, AssociationContext, PresentationVerdict, ScpRequest, ServiceClassProvider, ServiceType};
use crate::audit;
use crate::config::QueryConfig;
use crate::descriptor::{DescriptorStore, InstanceDescriptor};
use crate::dimse::cfind::{CompositeFindRequest, CompositeFindResponse, COMMAND_FIELD_COMPOSITE_FIND_REQUEST};
use crate::dimse::{get_multi_str, get_str, status, WriteError};
use crate::store::criteria::{
	Condition, PatientCriteria, PatientField, RequestField, SeriesCriteria, SeriesField, StudyCriteria,
	StudyField,
};
use crate::store::{
	Device, LocateError, Partition, QueueState, StoreError, StudyIndex, StudyLocator, StudyStatus,
};
use crate::types::{QueryInformationModel, QueryRetrieveLevel, UI, US};
use async_trait::async_trait;
use dicom::core::header::Header;
use dicom::core::{DataElement, Tag, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use futures::TryStreamExt;
use populate::{availability, IdentifierBuilder, UNICODE};
use std::ops::ControlFlow;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

#[derive(Debug, Error)]
enum QueryError {
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error("{comment}")]
	Refused {
		status: US,
		comment: String,
		identifier: Option<InMemDicomObject>,
	},
}

impl QueryError {
	fn refused(status: US, comment: impl Into<String>) -> Self {
		Self::Refused {
			status,
			comment: comment.into(),
			identifier: None,
		}
	}
}

/// Resolves the information model and level of a C-FIND or C-MOVE identifier.
pub fn requested_level(
	sop_class_uid: &str,
	identifier: &InMemDicomObject,
) -> Result<(QueryInformationModel, QueryRetrieveLevel), String> {
	let model = QueryInformationModel::from_sop_class(sop_class_uid)
		.ok_or_else(|| format!("Unsupported information model {sop_class_uid}"))?;
	let level = get_str(identifier, tags::QUERY_RETRIEVE_LEVEL)
		.ok_or_else(|| String::from("Missing QueryRetrieveLevel"))?
		.parse::<QueryRetrieveLevel>()
		.map_err(|level| format!("Invalid QueryRetrieveLevel {level}"))?;
	if !model.supports(level) {
		return Err(format!("QueryRetrieveLevel {level} is not supported by the {model:?} root model"));
	}
	Ok((model, level))
}

fn condition(identifier: &InMemDicomObject, tag: Tag) -> Option<Condition> {
	get_str(identifier, tag).and_then(|value| Condition::from_value(&value))
}

fn range(identifier: &InMemDicomObject, tag: Tag) -> Option<Condition> {
	get_str(identifier, tag).and_then(|value| Condition::from_range(&value))
}

fn uid_list(identifier: &InMemDicomObject, tag: Tag) -> Option<Condition> {
	Condition::from_values(get_multi_str(identifier, tag))
}

fn collect<F: Copy>(keys: impl IntoIterator<Item = (F, Option<Condition>)>) -> Vec<(F, Condition)> {
	keys.into_iter()
		.filter_map(|(field, condition)| condition.map(|condition| (field, condition)))
		.collect()
}

fn patient_criteria(identifier: &InMemDicomObject) -> PatientCriteria {
	let study_conditions = collect([
		(StudyField::PatientsSex, condition(identifier, tags::PATIENT_SEX)),
		(StudyField::PatientsBirthDate, range(identifier, tags::PATIENT_BIRTH_DATE)),
	]);
	PatientCriteria {
		conditions: collect([
			(PatientField::PatientId, condition(identifier, tags::PATIENT_ID)),
			(PatientField::PatientsName, condition(identifier, tags::PATIENT_NAME)),
			(PatientField::IssuerOfPatientId, condition(identifier, tags::ISSUER_OF_PATIENT_ID)),
		]),
		studies: (!study_conditions.is_empty()).then(|| StudyCriteria {
			conditions: study_conditions,
			..StudyCriteria::default()
		}),
	}
}

fn study_criteria(identifier: &InMemDicomObject, status: StudyStatus) -> StudyCriteria {
	let modalities = Condition::from_values(get_multi_str(identifier, tags::MODALITIES_IN_STUDY));
	StudyCriteria {
		conditions: collect([
			(StudyField::StudyInstanceUid, uid_list(identifier, tags::STUDY_INSTANCE_UID)),
			(StudyField::PatientId, condition(identifier, tags::PATIENT_ID)),
			(StudyField::PatientsName, condition(identifier, tags::PATIENT_NAME)),
			(StudyField::PatientsBirthDate, range(identifier, tags::PATIENT_BIRTH_DATE)),
			(StudyField::PatientsSex, condition(identifier, tags::PATIENT_SEX)),
			(StudyField::StudyDate, range(identifier, tags::STUDY_DATE)),
			(StudyField::StudyTime, range(identifier, tags::STUDY_TIME)),
			(StudyField::AccessionNumber, condition(identifier, tags::ACCESSION_NUMBER)),
			(StudyField::StudyId, condition(identifier, tags::STUDY_ID)),
			(StudyField::StudyDescription, condition(identifier, tags::STUDY_DESCRIPTION)),
			(StudyField::ReferringPhysiciansName, condition(identifier, tags::REFERRING_PHYSICIAN_NAME)),
		]),
		series: modalities.map(|modality| SeriesCriteria {
			conditions: vec![(SeriesField::Modality, modality)],
			..SeriesCriteria::default()
		}),
		patient_key: None,
		status: Some(status),
		excluded_queue_states: vec![QueueState::DeleteScheduled, QueueState::EditScheduled],
	}
}

fn series_criteria(identifier: &InMemDicomObject, study_key: uuid::Uuid) -> SeriesCriteria {
	let request_attributes = identifier
		.get(tags::REQUEST_ATTRIBUTES_SEQUENCE)
		.and_then(|element| element.items())
		.and_then(|items| items.first())
		.map(|item| {
			collect([
				(RequestField::ScheduledProcedureStepId, condition(item, tags::SCHEDULED_PROCEDURE_STEP_ID)),
				(RequestField::RequestedProcedureId, condition(item, tags::REQUESTED_PROCEDURE_ID)),
			])
		})
		.unwrap_or_default();

	SeriesCriteria {
		study_keys: Some(vec![study_key]),
		conditions: collect([
			(SeriesField::SeriesInstanceUid, uid_list(identifier, tags::SERIES_INSTANCE_UID)),
			(SeriesField::Modality, condition(identifier, tags::MODALITY)),
			(SeriesField::SeriesNumber, condition(identifier, tags::SERIES_NUMBER)),
			(SeriesField::SeriesDescription, condition(identifier, tags::SERIES_DESCRIPTION)),
			(
				SeriesField::PerformedProcedureStepStartDate,
				range(identifier, tags::PERFORMED_PROCEDURE_STEP_START_DATE),
			),
			(
				SeriesField::PerformedProcedureStepStartTime,
				range(identifier, tags::PERFORMED_PROCEDURE_STEP_START_TIME),
			),
		]),
		request_attributes,
	}
}

/// Keys not matched against the instance attributes at image level.
const IMAGE_LEVEL_SKIPPED: &[Tag] = &[
	tags::QUERY_RETRIEVE_LEVEL,
	tags::SPECIFIC_CHARACTER_SET,
	tags::STUDY_INSTANCE_UID,
	tags::SERIES_INSTANCE_UID,
	tags::RETRIEVE_AE_TITLE,
	tags::INSTANCE_AVAILABILITY,
];

fn instance_matches(identifier: &InMemDicomObject, instance: &InstanceDescriptor) -> bool {
	identifier.iter().all(|element| {
		let tag = element.tag();
		if element.vr() == VR::SQ || IMAGE_LEVEL_SKIPPED.contains(&tag) {
			return true;
		}
		let condition = if tag == tags::SOP_INSTANCE_UID {
			uid_list(identifier, tag)
		} else {
			condition(identifier, tag)
		};
		condition.is_none_or(|condition| {
			let value = match tag {
				tags::SOP_INSTANCE_UID => Some(instance.sop_instance_uid.as_str()),
				tags::SOP_CLASS_UID => Some(instance.sop_class_uid.as_str()),
				tag => instance.attribute(tag).map(|attribute| attribute.value.as_str()),
			};
			value.is_some_and(|value| condition.matches(value))
		})
	})
}

pub struct QueryServiceProvider {
	index: Arc<dyn StudyIndex>,
	locator: Arc<dyn StudyLocator>,
	descriptors: Arc<dyn DescriptorStore>,
	config: QueryConfig,
}

impl QueryServiceProvider {
	pub fn new(
		index: Arc<dyn StudyIndex>,
		locator: Arc<dyn StudyLocator>,
		descriptors: Arc<dyn DescriptorStore>,
		config: QueryConfig,
	) -> Self {
		Self {
			index,
			locator,
			descriptors,
			config,
		}
	}

	fn charset<'a>(&self, row: &'a str) -> Option<&'a str> {
		if self.config.unicode_responses {
			Some(UNICODE)
		} else {
			Some(row)
		}
	}

	async fn find_patients(
		&self,
		context: &AssociationContext,
		identifier: &InMemDicomObject,
		buffer: &mut ResponseBuffer<'_>,
	) -> Result<QueryOutcome, QueryError> {
		let mut rows = self
			.index
			.find_patients(&context.partition.ae_title, patient_criteria(identifier))
			.await?;
		while let Some(patient) = rows.try_next().await? {
			let response = IdentifierBuilder::new(identifier, QueryRetrieveLevel::Patient)
				.common(
					&context.partition.ae_title,
					availability(StudyStatus::Online),
					self.charset(&patient.specific_character_set),
				)
				.fill(|tag| populate::patient_value(&patient, tag));
			if let ControlFlow::Break(outcome) = buffer.push(response).await? {
				return Ok(outcome);
			}
		}
		Ok(QueryOutcome::Completed)
	}

	async fn find_studies(
		&self,
		context: &AssociationContext,
		identifier: &InMemDicomObject,
		buffer: &mut ResponseBuffer<'_>,
	) -> Result<QueryOutcome, QueryError> {
		let with_modalities = identifier.get(tags::MODALITIES_IN_STUDY).is_some();
		for status in [StudyStatus::Online, StudyStatus::Nearline] {
			let mut rows = self
				.index
				.find_studies(&context.partition.ae_title, study_criteria(identifier, status))
				.await?;
			while let Some(study) = rows.try_next().await? {
				let modalities = if with_modalities {
					match self.index.modalities_in_study(study.key).await {
						Ok(modalities) => Some(modalities),
						Err(err) => {
							warn!(study_instance_uid = %study.study_instance_uid, "Failed to load modalities: {err}");
							None
						}
					}
				} else {
					None
				};
				let response = IdentifierBuilder::new(identifier, QueryRetrieveLevel::Study)
					.common(
						&context.partition.ae_title,
						availability(study.status),
						self.charset(&study.specific_character_set),
					)
					.fill(|tag| populate::study_value(&study, modalities.as_deref(), tag));
				if let ControlFlow::Break(outcome) = buffer.push(response).await? {
					return Ok(outcome);
				}
			}
		}
		Ok(QueryOutcome::Completed)
	}

	async fn find_series(
		&self,
		context: &AssociationContext,
		identifier: &InMemDicomObject,
		buffer: &mut ResponseBuffer<'_>,
	) -> Result<QueryOutcome, QueryError> {
		let study_instance_uids = get_multi_str(identifier, tags::STUDY_INSTANCE_UID);
		if study_instance_uids.is_empty() {
			return Err(QueryError::refused(
				status::UNABLE_TO_PROCESS,
				"StudyInstanceUID is required for series level queries",
			));
		}

		for study_instance_uid in &study_instance_uids {
			let Some(study) = self
				.index
				.find_study(&context.partition.ae_title, study_instance_uid)
				.await?
			else {
				debug!(study_instance_uid, "Study not found, skipping");
				continue;
			};
			let mut rows = self
				.index
				.find_series(&context.partition.ae_title, series_criteria(identifier, study.key))
				.await?;
			while let Some(series) = rows.try_next().await? {
				let response = IdentifierBuilder::new(identifier, QueryRetrieveLevel::Series)
					.common(
						&context.partition.ae_title,
						availability(study.status),
						self.charset(&study.specific_character_set),
					)
					.request_attributes(&series.request_attributes)
					.fill(|tag| populate::series_value(&study, &series, tag));
				if let ControlFlow::Break(outcome) = buffer.push(response).await? {
					return Ok(outcome);
				}
			}
		}
		Ok(QueryOutcome::Completed)
	}

	async fn find_instances(
		&self,
		context: &AssociationContext,
		identifier: &InMemDicomObject,
		buffer: &mut ResponseBuffer<'_>,
	) -> Result<QueryOutcome, QueryError> {
		let (Some(study_instance_uid), Some(series_instance_uid)) = (
			get_str(identifier, tags::STUDY_INSTANCE_UID),
			get_str(identifier, tags::SERIES_INSTANCE_UID),
		) else {
			return Err(QueryError::refused(
				status::UNABLE_TO_PROCESS,
				"StudyInstanceUID and SeriesInstanceUID are required for image level queries",
			));
		};

		let location = match self
			.locator
			.readable_location(&context.partition, &study_instance_uid)
			.await
		{
			Ok(location) => location,
			Err(LocateError::Nearline { .. }) => {
				let identifier = InMemDicomObject::from_element_iter([
					DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, study_instance_uid.clone())),
					DataElement::new(tags::INSTANCE_AVAILABILITY, VR::CS, dicom_value!(Str, "NEARLINE")),
				]);
				return Err(QueryError::Refused {
					status: status::UNABLE_TO_PROCESS,
					comment: format!("Study {study_instance_uid} is nearline"),
					identifier: Some(identifier),
				});
			}
			Err(LocateError::NotFound(uid)) => {
				return Err(QueryError::refused(status::UNABLE_TO_PROCESS, format!("Unknown study {uid}")));
			}
			Err(LocateError::Store(err)) => return Err(err.into()),
		};

		let descriptors = Arc::clone(&self.descriptors);
		let descriptor = tokio::task::spawn_blocking(move || descriptors.load(&location))
			.await
			.map_err(|err| QueryError::refused(status::UNABLE_TO_PROCESS, err.to_string()))?
			.map_err(|err| QueryError::refused(status::UNABLE_TO_PROCESS, err.to_string()))?;
		let Some(series) = descriptor.find_series(&series_instance_uid) else {
			return Err(QueryError::refused(
				status::UNABLE_TO_PROCESS,
				format!("Unknown series {series_instance_uid}"),
			));
		};

		for instance in series.instances.values() {
			if !instance_matches(identifier, instance) {
				continue;
			}
			let charset = instance
				.attribute(tags::SPECIFIC_CHARACTER_SET)
				.map(|attribute| attribute.value.as_str())
				.unwrap_or_default();
			let response = IdentifierBuilder::new(identifier, QueryRetrieveLevel::Image)
				.common(
					&context.partition.ae_title,
					availability(StudyStatus::Online),
					self.charset(charset),
				)
				.fill(|tag| populate::instance_value(&study_instance_uid, &series_instance_uid, instance, tag));
			if let ControlFlow::Break(outcome) = buffer.push(response).await? {
				return Ok(outcome);
			}
		}
		Ok(QueryOutcome::Completed)
	}
}

#[async_trait]
impl ServiceClassProvider for QueryServiceProvider {
	fn service_type(&self) -> ServiceType {
		ServiceType::Query
	}

	fn command_fields(&self) -> &'static [US] {
		&[COMMAND_FIELD_COMPOSITE_FIND_REQUEST]
	}

	fn supported_sop_classes(&self, _partition: &Partition) -> Vec<UI> {
		[QueryInformationModel::Study, QueryInformationModel::Patient]
			.iter()
			.map(|model| UI::from(model.find_sop_class()))
			.collect()
	}

	fn verify_presentation_context(
		&self,
		_partition: &Partition,
		device: Option<&Device>,
		_abstract_syntax: &str,
	) -> PresentationVerdict {
		if permits(device, ServiceType::Query) {
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
		let request = CompositeFindRequest::try_from(message)?;
		let sop_class_uid = request.affected_sop_class_uid.as_str();

		let level = match requested_level(sop_class_uid, &request.identifier) {
			Ok((_, level)) => level,
			Err(comment) => {
				warn!("Rejected C-FIND-RQ: {comment}");
				audit::query_failed(&context, None, status::IDENTIFIER_DOES_NOT_MATCH_SOP_CLASS, &comment);
				let response = CompositeFindResponse::new(
					request.message_id,
					sop_class_uid,
					status::IDENTIFIER_DOES_NOT_MATCH_SOP_CLASS,
				)
				.error_comment(comment);
				writer.write(response.into(), presentation_context_id).await?;
				return Ok(());
			}
		};
		debug!(%level, message_id = request.message_id, "Received C-FIND-RQ");

		let mut buffer = ResponseBuffer::new(
			writer.as_ref(),
			&cancel,
			presentation_context_id,
			request.message_id,
			sop_class_uid,
			self.config.buffered_responses,
			self.config.max_responses(),
		);
		let result = match level {
			QueryRetrieveLevel::Patient => {
				self.find_patients(&context, &request.identifier, &mut buffer).await
			}
			QueryRetrieveLevel::Study => self.find_studies(&context, &request.identifier, &mut buffer).await,
			QueryRetrieveLevel::Series => self.find_series(&context, &request.identifier, &mut buffer).await,
			QueryRetrieveLevel::Image => {
				self.find_instances(&context, &request.identifier, &mut buffer).await
			}
		};

		match result {
			Ok(outcome) => {
				let matches = buffer.finish(outcome).await?;
				audit::query(&context, level, outcome, matches);
			}
			Err(QueryError::Write(err)) => return Err(err.into()),
			Err(err) => {
				let (status, comment, identifier) = match err {
					QueryError::Refused {
						status,
						comment,
						identifier,
					} => (status, comment, identifier),
					other => (status::UNABLE_TO_PROCESS, other.to_string(), None),
				};
				warn!(%level, status, "C-FIND failed: {comment}");
				audit::query_failed(&context, Some(level), status, &comment);
				let mut response = CompositeFindResponse::new(request.message_id, sop_class_uid, status)
					.error_comment(comment);
				if let Some(identifier) = identifier {
					response = response.identifier(identifier);
				}
				writer.write(response.into(), presentation_context_id).await?;
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::descriptor::JsonDescriptorStore;
	use crate::dimse::DicomMessage;
	use crate::scp::tests::{association, RecordingWriter};
	use crate::scp::ResponseWriter;
	use crate::store::{IndexEntry, JsonStore, Patient, Series, Study};
	use dicom::dictionary_std::uids;
	use tokio_util::sync::CancellationToken;

	const STUDY_FIND: &str = uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND;

	fn entry(study_uid: &str, modality: &str) -> IndexEntry {
		IndexEntry {
			patient: Patient {
				patient_id: String::from("PAT-1"),
				patients_name: String::from("DOE^JANE"),
				..Patient::default()
			},
			study: Study {
				study_instance_uid: UI::from(study_uid),
				patient_id: String::from("PAT-1"),
				patients_name: String::from("DOE^JANE"),
				study_date: String::from("20240101"),
				..Study::default()
			},
			series: Series {
				series_instance_uid: format!("{study_uid}.1"),
				modality: String::from(modality),
				..Series::default()
			},
			sop_instance_uid: format!("{study_uid}.1.1"),
		}
	}

	async fn provider(max_responses: i64, studies: usize) -> QueryServiceProvider {
		let store = Arc::new(JsonStore::in_memory(Vec::new()));
		for index in 0..studies {
			store
				.record_instance("ARCHIVE", entry(&format!("1.2.{index}"), "CT"))
				.await
				.unwrap();
		}
		QueryServiceProvider::new(
			Arc::clone(&store) as Arc<dyn StudyIndex>,
			store,
			Arc::new(JsonDescriptorStore),
			QueryConfig {
				buffered_responses: 25,
				max_responses,
				unicode_responses: false,
			},
		)
	}

	fn find_request(sop_class_uid: &str, identifier: InMemDicomObject) -> DicomMessage {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_FIND_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [5])),
		]);
		let mut message = DicomMessage::new(command, Some(identifier));
		message.presentation_context_id = Some(1);
		message
	}

	async fn run(provider: &QueryServiceProvider, message: DicomMessage) -> Arc<RecordingWriter> {
		let writer = Arc::new(RecordingWriter::default());
		provider
			.on_receive_request(ScpRequest {
				context: Arc::new(association(None, Vec::new())),
				message,
				writer: Arc::clone(&writer) as Arc<dyn ResponseWriter>,
				cancel: CancellationToken::new(),
			})
			.await
			.unwrap();
		writer
	}

	fn study_identifier() -> InMemDicomObject {
		InMemDicomObject::from_element_iter([
			DataElement::new(tags::QUERY_RETRIEVE_LEVEL, VR::CS, dicom_value!(Str, "STUDY")),
			DataElement::empty(tags::STUDY_INSTANCE_UID, VR::UI),
			DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, "PAT-1")),
			DataElement::empty(tags::MODALITIES_IN_STUDY, VR::CS),
		])
	}

	#[tokio::test]
	async fn study_query_stops_at_max_responses() {
		let provider = provider(2, 5).await;
		let writer = run(&provider, find_request(STUDY_FIND, study_identifier())).await;
		assert_eq!(writer.statuses(), vec![status::PENDING, status::PENDING, status::SUCCESS]);

		let messages = writer.take();
		let identifier = messages[0].data.as_ref().expect("identifier");
		assert_eq!(get_str(identifier, tags::MODALITIES_IN_STUDY).as_deref(), Some("CT"));
		assert_eq!(get_str(identifier, tags::RETRIEVE_AE_TITLE).as_deref(), Some("ARCHIVE"));
		assert_eq!(get_str(identifier, tags::QUERY_RETRIEVE_LEVEL).as_deref(), Some("STUDY"));
	}

	#[tokio::test]
	async fn patient_level_is_refused_under_study_root() {
		let provider = provider(-1, 1).await;
		let identifier = InMemDicomObject::from_element_iter([DataElement::new(
			tags::QUERY_RETRIEVE_LEVEL,
			VR::CS,
			dicom_value!(Str, "PATIENT"),
		)]);
		let writer = run(&provider, find_request(STUDY_FIND, identifier)).await;
		assert_eq!(writer.statuses(), vec![status::IDENTIFIER_DOES_NOT_MATCH_SOP_CLASS]);
	}

	#[tokio::test]
	async fn series_query_of_unknown_study_has_no_matches() {
		let provider = provider(-1, 1).await;
		let identifier = InMemDicomObject::from_element_iter([
			DataElement::new(tags::QUERY_RETRIEVE_LEVEL, VR::CS, dicom_value!(Str, "SERIES")),
			DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, "9.9.9")),
		]);
		let writer = run(&provider, find_request(STUDY_FIND, identifier)).await;
		assert_eq!(writer.statuses(), vec![status::SUCCESS]);

		let identifier = InMemDicomObject::from_element_iter([
			DataElement::new(tags::QUERY_RETRIEVE_LEVEL, VR::CS, dicom_value!(Str, "SERIES")),
			DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, "1.2.0")),
			DataElement::empty(tags::MODALITY, VR::CS),
		]);
		let writer = run(&provider, find_request(STUDY_FIND, identifier)).await;
		assert_eq!(writer.statuses(), vec![status::PENDING, status::SUCCESS]);
	}

	#[test]
	fn sop_instance_uid_list_matches_at_image_level() {
		let mut instance = crate::descriptor::InstanceDescriptor {
			sop_instance_uid: UI::from("1.2.3.2"),
			sop_class_uid: UI::from("1.2.840.10008.5.1.4.1.1.2"),
			transfer_syntax_uid: UI::from(uids::EXPLICIT_VR_LITTLE_ENDIAN),
			file_size: 0,
			attributes: Default::default(),
		};
		let identifier = InMemDicomObject::from_element_iter([
			DataElement::new(tags::QUERY_RETRIEVE_LEVEL, VR::CS, dicom_value!(Str, "IMAGE")),
			DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, "1.2.3.1\\1.2.3.2")),
			DataElement::empty(tags::INSTANCE_NUMBER, VR::IS),
		]);
		assert!(instance_matches(&identifier, &instance));

		instance.sop_instance_uid = UI::from("1.2.3.3");
		assert!(!instance_matches(&identifier, &instance));
	}
}
