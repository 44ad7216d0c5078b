use super::{
	permits, AssociationContext, PresentationVerdict, ScpRequest, ServiceClassProvider,
	ServiceType,
};
use crate::audit;
use crate::dimse::cstore::{
	CompositeStoreResponse, StoreCommand, COMMAND_FIELD_COMPOSITE_STORE_REQUEST,
};
use crate::dimse::{get_int, get_str, status, DicomMessage};
use crate::import::{ImportRequest, ImportSource, Importer};
use crate::store::{Device, DuplicatePolicy, Partition};
use crate::types::{UI, US};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};
use async_trait::async_trait;
use dicom::dictionary_std::tags;
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub const KEY_OBJECT_SELECTION: &str = "1.2.840.10008.5.1.4.1.1.88.59";

/// Key object selection and presentation state classes, accepted from devices with
/// `accept_kopr` regardless of the SOP class lists.
pub const KOPR_SOP_CLASSES: &[&str] = &[
	KEY_OBJECT_SELECTION,
	"1.2.840.10008.5.1.4.1.1.11.1", // Grayscale Softcopy Presentation State
	"1.2.840.10008.5.1.4.1.1.11.2", // Color Softcopy Presentation State
	"1.2.840.10008.5.1.4.1.1.11.3", // Pseudo-Color Softcopy Presentation State
	"1.2.840.10008.5.1.4.1.1.11.4", // Blending Softcopy Presentation State
];

/// Enhanced and multi-frame classes, received straight into a file.
pub const STREAMED_SOP_CLASSES: &[&str] = &[
	"1.2.840.10008.5.1.4.1.1.2.1",   // Enhanced CT
	"1.2.840.10008.5.1.4.1.1.4.1",   // Enhanced MR
	"1.2.840.10008.5.1.4.1.1.12.1.1", // Enhanced XA
	"1.2.840.10008.5.1.4.1.1.12.2.1", // Enhanced XRF
	"1.2.840.10008.5.1.4.1.1.128.1", // Legacy Converted Enhanced PET
	"1.2.840.10008.5.1.4.1.1.130",   // Enhanced PET
	"1.2.840.10008.5.1.4.1.1.6.2",   // Enhanced US Volume
	"1.2.840.10008.5.1.4.1.1.3.1",   // Ultrasound Multi-frame
	"1.2.840.10008.5.1.4.1.1.7.2",   // Multi-frame Grayscale Byte SC
	"1.2.840.10008.5.1.4.1.1.7.3",   // Multi-frame Grayscale Word SC
	"1.2.840.10008.5.1.4.1.1.7.4",   // Multi-frame True Color SC
	"1.2.840.10008.5.1.4.1.1.13.1.3", // Breast Tomosynthesis
	"1.2.840.10008.5.1.4.1.1.77.1.1.1", // Video Endoscopic
];

/// Storage classes accepted when a partition does not restrict them.
pub const STORAGE_SOP_CLASSES: &[&str] = &[
	"1.2.840.10008.5.1.4.1.1.1",     // Computed Radiography
	"1.2.840.10008.5.1.4.1.1.1.1",   // Digital X-Ray for Presentation
	"1.2.840.10008.5.1.4.1.1.1.1.1", // Digital X-Ray for Processing
	"1.2.840.10008.5.1.4.1.1.1.2",   // Digital Mammography for Presentation
	"1.2.840.10008.5.1.4.1.1.1.2.1", // Digital Mammography for Processing
	"1.2.840.10008.5.1.4.1.1.2",     // CT
	"1.2.840.10008.5.1.4.1.1.4",     // MR
	"1.2.840.10008.5.1.4.1.1.6.1",   // Ultrasound
	"1.2.840.10008.5.1.4.1.1.7",     // Secondary Capture
	"1.2.840.10008.5.1.4.1.1.12.1",  // X-Ray Angiographic
	"1.2.840.10008.5.1.4.1.1.12.2",  // X-Ray Radiofluoroscopic
	"1.2.840.10008.5.1.4.1.1.20",    // Nuclear Medicine
	"1.2.840.10008.5.1.4.1.1.128",   // Positron Emission Tomography
	"1.2.840.10008.5.1.4.1.1.481.1", // RT Image
	"1.2.840.10008.5.1.4.1.1.481.2", // RT Dose
	"1.2.840.10008.5.1.4.1.1.481.3", // RT Structure Set
	"1.2.840.10008.5.1.4.1.1.481.5", // RT Plan
	"1.2.840.10008.5.1.4.1.1.88.11", // Basic Text SR
	"1.2.840.10008.5.1.4.1.1.88.22", // Enhanced SR
	"1.2.840.10008.5.1.4.1.1.88.33", // Comprehensive SR
	"1.2.840.10008.5.1.4.1.1.104.1", // Encapsulated PDF
	"1.2.840.10008.5.1.4.1.1.77.1.4", // VL Photographic
];

fn known_sop_classes() -> impl Iterator<Item = &'static str> {
	STORAGE_SOP_CLASSES
		.iter()
		.chain(STREAMED_SOP_CLASSES)
		.chain(KOPR_SOP_CLASSES)
		.copied()
}

pub struct StorageServiceProvider {
	importer: Arc<dyn Importer>,
	temp_dir: PathBuf,
	streaming: bool,
}

impl StorageServiceProvider {
	pub fn new(importer: Arc<dyn Importer>, temp_dir: PathBuf, streaming: bool) -> Self {
		Self {
			importer,
			temp_dir,
			streaming,
		}
	}

	fn import_source(
		context: &AssociationContext,
		command: &StoreCommand,
		message: DicomMessage,
	) -> Result<ImportSource, String> {
		if let Some(file) = message.file {
			return Ok(ImportSource::File(file));
		}
		let data = message.data.ok_or("C-STORE-RQ without data set")?;
		let presentation_context = context
			.presentation_context(message.presentation_context_id)
			.ok_or("Unknown presentation context")?;
		let meta = FileMetaTableBuilder::new()
			.media_storage_sop_class_uid(command.affected_sop_class_uid.as_str())
			.media_storage_sop_instance_uid(command.affected_sop_instance_uid.as_str())
			.transfer_syntax(presentation_context.transfer_syntax.as_str())
			.implementation_class_uid(IMPLEMENTATION_CLASS_UID)
			.implementation_version_name(IMPLEMENTATION_VERSION_NAME)
			.build()
			.map_err(|err| format!("Failed to build file meta group: {err}"))?;
		Ok(ImportSource::Dataset(Box::new(data.with_exact_meta(meta))))
	}

	/// Removes the per-operation folder of a spooled file.
	async fn discard_spool_folder(&self, file: &Path) {
		let Some(folder) = file.parent() else {
			return;
		};
		if folder == self.temp_dir || !folder.starts_with(&self.temp_dir) {
			return;
		}
		match tokio::fs::remove_dir_all(folder).await {
			Ok(()) => {}
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
			Err(err) => warn!(folder = %folder.display(), "Failed to remove spool folder: {err}"),
		}
	}
}

#[async_trait]
impl ServiceClassProvider for StorageServiceProvider {
	fn service_type(&self) -> ServiceType {
		ServiceType::Storage
	}

	fn command_fields(&self) -> &'static [US] {
		&[COMMAND_FIELD_COMPOSITE_STORE_REQUEST]
	}

	fn supported_sop_classes(&self, partition: &Partition) -> Vec<UI> {
		let mut sop_classes: Vec<UI> = known_sop_classes().map(UI::from).collect();
		for sop_class in &partition.sop_classes {
			if !sop_classes.contains(sop_class) {
				sop_classes.push(sop_class.clone());
			}
		}
		sop_classes
	}

	fn verify_presentation_context(
		&self,
		partition: &Partition,
		device: Option<&Device>,
		abstract_syntax: &str,
	) -> PresentationVerdict {
		if !permits(device, ServiceType::Storage) {
			return PresentationVerdict::RejectUser;
		}
		let allowed = device
			.and_then(|device| device.sop_classes.as_ref())
			.unwrap_or(&partition.sop_classes);
		if allowed.is_empty() || allowed.iter().any(|uid| uid == abstract_syntax) {
			return PresentationVerdict::Accept;
		}
		let kopr = KOPR_SOP_CLASSES.contains(&abstract_syntax);
		if kopr && device.is_some_and(|device| device.accept_kopr) {
			PresentationVerdict::Accept
		} else {
			PresentationVerdict::RejectUser
		}
	}

	fn spool_target(
		&self,
		_context: &AssociationContext,
		command: &InMemDicomObject,
	) -> Option<PathBuf> {
		if !self.streaming
			|| get_int(command, tags::COMMAND_FIELD) != Some(COMMAND_FIELD_COMPOSITE_STORE_REQUEST)
		{
			return None;
		}
		let sop_class_uid = get_str(command, tags::AFFECTED_SOP_CLASS_UID)?;
		let sop_instance_uid = get_str(command, tags::AFFECTED_SOP_INSTANCE_UID)?;
		STREAMED_SOP_CLASSES
			.contains(&sop_class_uid.as_str())
			.then(|| {
				self.temp_dir
					.join(Uuid::new_v4().to_string())
					.join(format!("{sop_instance_uid}.dcm"))
			})
	}

	#[instrument(skip_all, fields(calling_ae = %request.context.calling_ae))]
	async fn on_receive_request(&self, request: ScpRequest) -> anyhow::Result<()> {
		let ScpRequest {
			context,
			message,
			writer,
			..
		} = request;
		let command = StoreCommand::try_from(&message)?;
		let presentation_context_id = message.presentation_context_id;
		let spooled = message.file.clone();

		let response = match Self::import_source(&context, &command, message) {
			Ok(source) => {
				let duplicate_override = context
					.partition
					.is_primary_source(&context.calling_ae)
					.then_some(DuplicatePolicy::AcceptLatest);
				let result = self
					.importer
					.import(ImportRequest {
						partition: context.partition.clone(),
						source_ae: context.calling_ae.clone(),
						destination_ae: context.called_ae.clone(),
						batch_id: context.batch_id.clone(),
						duplicate_override,
						source,
					})
					.await;
				audit::instance_received(&context, &command.affected_sop_instance_uid, &result);

				if result.successful {
					info!(
						study_instance_uid = result.study_instance_uid.as_deref().unwrap_or_default(),
						accession_number = result.accession_number.as_deref().unwrap_or_default(),
						"Stored instance {}",
						command.affected_sop_instance_uid
					);
					CompositeStoreResponse::new(&command, result.status)
				} else {
					let comment = result.error_message.unwrap_or_default();
					warn!(
						sop_instance_uid = %command.affected_sop_instance_uid,
						status = result.status,
						"Failed to store instance: {comment}"
					);
					CompositeStoreResponse::new(&command, result.status).error_comment(comment)
				}
			}
			Err(comment) => {
				warn!(sop_instance_uid = %command.affected_sop_instance_uid, "{comment}");
				CompositeStoreResponse::new(&command, status::PROCESSING_FAILURE).error_comment(comment)
			}
		};

		if let Some(file) = spooled {
			self.discard_spool_folder(&file).await;
		}

		writer.write(response.into(), presentation_context_id).await?;
		Ok(())
	}
}
