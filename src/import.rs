//! Imports received instances into a partition's study folders.
//!
//! An import writes the instance file, updates the study descriptor and records the
//! instance in the study index as one [`CommandProcessor`] run, so a failure at any
//! step leaves the archive as it was.

use crate::command::descriptor::{InsertInstanceCommand, SaveDescriptorCommand};
use crate::command::file::{CreateDirectoryCommand, RenameFileCommand, SaveFileCommand};
use crate::command::{
	Command, CommandContext, CommandError, CommandProcessor, ExecutionScope,
};
use crate::config::FileConfig;
use crate::descriptor::{instance_path, DescriptorStore, InstanceDescriptor};
use crate::dimse::{get_str, status};
use crate::store::{
	DuplicatePolicy, IndexEntry, LocateError, Partition, Patient, RequestAttributes, Series,
	Study, StudyIndex, StudyLocator,
};
use crate::types::{AE, UI, US};
use async_trait::async_trait;
use dashmap::DashMap;
use dicom::dictionary_std::tags;
use dicom::object::{FileDicomObject, InMemDicomObject, OpenFileOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tracing::{debug, info, instrument, warn};

/// Where the instance to import comes from.
pub enum ImportSource {
	/// A data set received in memory.
	Dataset(Box<FileDicomObject<InMemDicomObject>>),
	/// A Part 10 file received straight to disk. It is moved into the archive.
	File(PathBuf),
}

pub struct ImportRequest {
	pub partition: Partition,
	pub source_ae: AE,
	pub destination_ae: AE,
	/// Groups the instances received in one association.
	pub batch_id: String,
	/// Replaces the partition's duplicate policy for this request.
	pub duplicate_override: Option<DuplicatePolicy>,
	pub source: ImportSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingResult {
	pub successful: bool,
	pub status: US,
	pub sop_instance_uid: Option<UI>,
	pub study_instance_uid: Option<UI>,
	pub series_instance_uid: Option<UI>,
	pub accession_number: Option<String>,
	pub error_message: Option<String>,
}

impl ProcessingResult {
	fn success(identity: &Identity) -> Self {
		Self {
			successful: true,
			status: status::SUCCESS,
			sop_instance_uid: None,
			study_instance_uid: None,
			series_instance_uid: None,
			accession_number: None,
			error_message: None,
		}
		.with_identity(identity)
	}

	fn failure(status: US, message: impl Into<String>) -> Self {
		Self {
			successful: false,
			status,
			sop_instance_uid: None,
			study_instance_uid: None,
			series_instance_uid: None,
			accession_number: None,
			error_message: Some(message.into()),
		}
	}

	fn with_identity(mut self, identity: &Identity) -> Self {
		self.sop_instance_uid = Some(identity.sop_instance_uid.clone());
		self.study_instance_uid = Some(identity.study_instance_uid.clone());
		self.series_instance_uid = Some(identity.series_instance_uid.clone());
		self.accession_number = identity.accession_number.clone();
		self
	}
}

#[async_trait]
pub trait Importer: Send + Sync {
	async fn import(&self, request: ImportRequest) -> ProcessingResult;
}

struct Identity {
	study_instance_uid: UI,
	series_instance_uid: UI,
	sop_instance_uid: UI,
	accession_number: Option<String>,
}

impl Identity {
	fn of(dataset: &InMemDicomObject) -> Result<Self, &'static str> {
		Ok(Self {
			study_instance_uid: get_str(dataset, tags::STUDY_INSTANCE_UID)
				.ok_or("Study Instance UID is missing")?,
			series_instance_uid: get_str(dataset, tags::SERIES_INSTANCE_UID)
				.ok_or("Series Instance UID is missing")?,
			sop_instance_uid: get_str(dataset, tags::SOP_INSTANCE_UID)
				.ok_or("SOP Instance UID is missing")?,
			accession_number: get_str(dataset, tags::ACCESSION_NUMBER),
		})
	}
}

/// The header of an instance and its encoded content.
struct Prepared {
	header: InMemDicomObject,
	transfer_syntax: UI,
	content: Content,
	file_size: u64,
}

enum Content {
	Bytes(Vec<u8>),
	File(PathBuf),
}

fn prepare(source: ImportSource) -> Result<Prepared, String> {
	match source {
		ImportSource::Dataset(object) => {
			let object = *object;
			let mut content = Vec::new();
			object
				.write_all(&mut content)
				.map_err(|err| format!("Failed to encode instance: {err}"))?;
			let transfer_syntax = object.meta().transfer_syntax().trim_end_matches('\0').to_owned();
			Ok(Prepared {
				file_size: content.len() as u64,
				transfer_syntax,
				header: object.into_inner(),
				content: Content::Bytes(content),
			})
		}
		ImportSource::File(path) => {
			let object = OpenFileOptions::new()
				.read_until(tags::PIXEL_DATA)
				.open_file(&path)
				.map_err(|err| format!("Failed to read received file: {err}"))?;
			let file_size = std::fs::metadata(&path)
				.map_err(|err| format!("Failed to read received file: {err}"))?
				.len();
			Ok(Prepared {
				file_size,
				transfer_syntax: object.meta().transfer_syntax().trim_end_matches('\0').to_owned(),
				header: object.into_inner(),
				content: Content::File(path),
			})
		}
	}
}

fn text(dataset: &InMemDicomObject, tag: dicom::core::Tag) -> String {
	get_str(dataset, tag).unwrap_or_default()
}

/// Extracts the study index rows of an instance.
fn index_entry(dataset: &InMemDicomObject, source_ae: &str) -> IndexEntry {
	let specific_character_set = text(dataset, tags::SPECIFIC_CHARACTER_SET);
	let request_attributes = dataset
		.get(tags::REQUEST_ATTRIBUTES_SEQUENCE)
		.and_then(|element| element.items())
		.map(|items| {
			items
				.iter()
				.map(|item| RequestAttributes {
					scheduled_procedure_step_id: text(item, tags::SCHEDULED_PROCEDURE_STEP_ID),
					requested_procedure_id: text(item, tags::REQUESTED_PROCEDURE_ID),
				})
				.collect()
		})
		.unwrap_or_default();

	IndexEntry {
		patient: Patient {
			patient_id: text(dataset, tags::PATIENT_ID),
			patients_name: text(dataset, tags::PATIENT_NAME),
			issuer_of_patient_id: text(dataset, tags::ISSUER_OF_PATIENT_ID),
			specific_character_set: specific_character_set.clone(),
			..Patient::default()
		},
		study: Study {
			study_instance_uid: text(dataset, tags::STUDY_INSTANCE_UID),
			patient_id: text(dataset, tags::PATIENT_ID),
			patients_name: text(dataset, tags::PATIENT_NAME),
			patients_birth_date: text(dataset, tags::PATIENT_BIRTH_DATE),
			patients_sex: text(dataset, tags::PATIENT_SEX),
			patients_age: text(dataset, tags::PATIENT_AGE),
			study_date: text(dataset, tags::STUDY_DATE),
			study_time: text(dataset, tags::STUDY_TIME),
			accession_number: text(dataset, tags::ACCESSION_NUMBER),
			study_id: text(dataset, tags::STUDY_ID),
			study_description: text(dataset, tags::STUDY_DESCRIPTION),
			referring_physicians_name: text(dataset, tags::REFERRING_PHYSICIAN_NAME),
			specific_character_set,
			..Study::default()
		},
		series: Series {
			series_instance_uid: text(dataset, tags::SERIES_INSTANCE_UID),
			modality: text(dataset, tags::MODALITY),
			series_number: text(dataset, tags::SERIES_NUMBER),
			series_description: text(dataset, tags::SERIES_DESCRIPTION),
			performed_procedure_step_start_date: text(
				dataset,
				tags::PERFORMED_PROCEDURE_STEP_START_DATE,
			),
			performed_procedure_step_start_time: text(
				dataset,
				tags::PERFORMED_PROCEDURE_STEP_START_TIME,
			),
			source_ae_title: AE::from(source_ae),
			request_attributes,
			..Series::default()
		},
		sop_instance_uid: text(dataset, tags::SOP_INSTANCE_UID),
	}
}

/// Records the instance in the study index. Runs last, so it never needs an undo.
struct IndexInstanceCommand {
	index: Arc<dyn StudyIndex>,
	handle: Handle,
	partition: AE,
	entry: Option<IndexEntry>,
}

impl Command for IndexInstanceCommand {
	fn description(&self) -> &str {
		"Update study index"
	}

	fn requires_rollback(&self) -> bool {
		false
	}

	fn execute(&mut self, _scope: &mut ExecutionScope<'_>) -> Result<(), CommandError> {
		let Some(entry) = self.entry.take() else {
			return Ok(());
		};
		self.handle
			.block_on(self.index.record_instance(&self.partition, entry))
			.map_err(|err| CommandError::Failed(err.to_string()))
	}
}

/// Imports instances into `<partition root>/<study>/<series>/<sop>.dcm`.
pub struct FilesystemImporter {
	locator: Arc<dyn StudyLocator>,
	index: Arc<dyn StudyIndex>,
	descriptors: Arc<dyn DescriptorStore>,
	files: FileConfig,
	/// Serializes imports into the same study, as they share its descriptor.
	study_locks: DashMap<UI, Arc<tokio::sync::Mutex<()>>>,
}

impl FilesystemImporter {
	pub fn new(
		locator: Arc<dyn StudyLocator>,
		index: Arc<dyn StudyIndex>,
		descriptors: Arc<dyn DescriptorStore>,
		files: FileConfig,
	) -> Self {
		Self {
			locator,
			index,
			descriptors,
			files,
			study_locks: DashMap::new(),
		}
	}

	fn study_lock(&self, study_instance_uid: &str) -> Arc<tokio::sync::Mutex<()>> {
		Arc::clone(
			self.study_locks
				.entry(UI::from(study_instance_uid))
				.or_default()
				.value(),
		)
	}

	fn release_study_lock(&self, study_instance_uid: &str) {
		self.study_locks
			.remove_if(study_instance_uid, |_, lock| Arc::strong_count(lock) == 1);
	}

	async fn import_prepared(
		&self,
		partition: &Partition,
		source_ae: &str,
		duplicate_override: Option<DuplicatePolicy>,
		prepared: Prepared,
		identity: &Identity,
	) -> ProcessingResult {
		let location = match self
			.locator
			.writable_location(partition, &identity.study_instance_uid)
			.await
		{
			Ok(location) => location,
			Err(LocateError::Nearline { .. }) => {
				return ProcessingResult::failure(
					status::OUT_OF_RESOURCES,
					"Study is nearline and cannot be written to",
				)
				.with_identity(identity);
			}
			Err(err) => {
				return ProcessingResult::failure(status::PROCESSING_FAILURE, err.to_string())
					.with_identity(identity);
			}
		};

		let descriptor = match self.descriptors.load(&location) {
			Ok(descriptor) => descriptor,
			Err(err) => {
				return ProcessingResult::failure(status::PROCESSING_FAILURE, err.to_string())
					.with_identity(identity);
			}
		};

		let duplicate = descriptor
			.instance(&identity.series_instance_uid, &identity.sop_instance_uid)
			.is_some();
		if duplicate {
			let policy = duplicate_override.unwrap_or(partition.duplicate_policy);
			match policy {
				DuplicatePolicy::RejectDuplicates => {
					warn!(
						sop_instance_uid = %identity.sop_instance_uid,
						"Rejected duplicate instance"
					);
					return ProcessingResult::failure(
						status::DUPLICATE_SOP_INSTANCE,
						"Duplicate SOP instance",
					)
					.with_identity(identity);
				}
				DuplicatePolicy::SendSuccess => {
					debug!(
						sop_instance_uid = %identity.sop_instance_uid,
						"Ignored duplicate instance"
					);
					if let Content::File(path) = &prepared.content {
						if let Err(err) = tokio::fs::remove_file(path).await {
							warn!(path = %path.display(), "Failed to remove received file: {err}");
						}
					}
					return ProcessingResult::success(identity);
				}
				DuplicatePolicy::AcceptLatest => {
					info!(
						sop_instance_uid = %identity.sop_instance_uid,
						"Replacing duplicate instance"
					);
				}
			}
		}

		let instance = match InstanceDescriptor::from_dataset(
			&prepared.header,
			&prepared.transfer_syntax,
			prepared.file_size,
		) {
			Ok(instance) => instance,
			Err(err) => {
				return ProcessingResult::failure(status::PROCESSING_FAILURE, err.to_string())
					.with_identity(identity);
			}
		};

		let series_folder = location.path.join(&identity.series_instance_uid);
		let destination = instance_path(
			&location.path,
			&identity.series_instance_uid,
			&identity.sop_instance_uid,
		);
		let descriptor_path = self.descriptors.path(&location);
		let descriptor = Arc::new(Mutex::new(descriptor));
		let context = CommandContext::new(
			&self.files.temp_dir,
			&self.files.backup_dir,
			self.files.disposition,
		);

		let mut processor =
			CommandProcessor::new(format!("Import {}", identity.sop_instance_uid), context);
		processor.add(CreateDirectoryCommand::new(series_folder));
		match prepared.content {
			Content::Bytes(bytes) => {
				processor.add(SaveFileCommand::new(&destination, bytes, false));
			}
			Content::File(path) => processor.add(RenameFileCommand::new(path, &destination, false)),
		}
		processor.add(InsertInstanceCommand::new(
			Arc::clone(&descriptor),
			identity.series_instance_uid.clone(),
			instance,
		));
		processor.add(SaveDescriptorCommand::new(
			descriptor,
			Arc::clone(&self.descriptors),
			descriptor_path,
		));
		processor.add(IndexInstanceCommand {
			index: Arc::clone(&self.index),
			handle: Handle::current(),
			partition: partition.ae_title.clone(),
			entry: Some(index_entry(&prepared.header, source_ae)),
		});

		let outcome = tokio::task::spawn_blocking(move || {
			let result = processor.execute();
			(result, processor.failure_reason().map(str::to_owned))
		})
		.await;

		match outcome {
			Ok((Ok(()), _)) => {
				info!(
					study_instance_uid = %identity.study_instance_uid,
					sop_instance_uid = %identity.sop_instance_uid,
					"Imported instance"
				);
				ProcessingResult::success(identity)
			}
			Ok((Err(err), reason)) => ProcessingResult::failure(
				status::PROCESSING_FAILURE,
				reason.unwrap_or_else(|| err.to_string()),
			)
			.with_identity(identity),
			Err(err) => ProcessingResult::failure(status::PROCESSING_FAILURE, err.to_string())
				.with_identity(identity),
		}
	}
}

#[async_trait]
impl Importer for FilesystemImporter {
	#[instrument(skip_all, fields(
		source_ae = %request.source_ae,
		destination_ae = %request.destination_ae,
		batch_id = %request.batch_id,
	))]
	async fn import(&self, request: ImportRequest) -> ProcessingResult {
		let prepared = match prepare(request.source) {
			Ok(prepared) => prepared,
			Err(message) => return ProcessingResult::failure(status::PROCESSING_FAILURE, message),
		};
		let identity = match Identity::of(&prepared.header) {
			Ok(identity) => identity,
			Err(message) => {
				warn!("Rejected instance: {message}");
				if let Content::File(path) = &prepared.content {
					if let Err(err) = tokio::fs::remove_file(path).await {
						warn!(path = %path.display(), "Failed to remove received file: {err}");
					}
				}
				return ProcessingResult::failure(status::PROCESSING_FAILURE, message);
			}
		};

		let lock = self.study_lock(&identity.study_instance_uid);
		let result = {
			let _guard = lock.lock().await;
			self.import_prepared(
				&request.partition,
				&request.source_ae,
				request.duplicate_override,
				prepared,
				&identity,
			)
			.await
		};
		drop(lock);
		self.release_study_lock(&identity.study_instance_uid);
		result
	}
}
