//! DIMSE message layer on top of the dicom-ul associations.
//! - Verification (C-ECHO), storage (C-STORE), query (C-FIND) and retrieve (C-MOVE, C-CANCEL)
//!   message types live in their own modules.
//! - [`DicomMessageReader`] and [`DicomMessageWriter`] turn P-DATA fragments into
//!   [`DicomMessage`]s and back for every [`Association`].

pub mod association;
pub mod ccancel;
pub mod cecho;
pub mod cfind;
pub mod cmove;
pub mod cstore;
pub mod status;

use crate::types::{UI, US};
use association::{Association, AssociationError};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::mem::InMemElement;
use dicom::object::{FileMetaTableBuilder, InMemDicomObject, Tag};
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::{PDataValue, PDataValueType, PresentationContextNegotiated};
use dicom::ul::Pdu;
use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{instrument, trace, warn};

/// Should be set for [`tags::COMMAND_DATA_SET_TYPE`] if a DICOM message contains a data set.
/// This is the recommended value when creating new [`InMemDicomObject`]s for compatibility reasons.
/// For reading DICOM messages, prefer checking if (command_data_set_type != DATA_SET_MISSING) as
/// AEs are free to choose another value for a truthy state.
pub const DATA_SET_EXISTS: US = 0x0102;
/// Should be set for [`tags::COMMAND_DATA_SET_TYPE`] if a DICOM message has no data set.
pub const DATA_SET_MISSING: US = 0x0101; // DICOM NULL

/// Represents a DICOM message composed of a command set followed by an optional data set.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_6.3.html>
pub struct DicomMessage {
	/// The command set.
	pub command: InMemDicomObject,
	/// The data set.
	pub data: Option<InMemDicomObject>,
	/// The presentation context id
	pub presentation_context_id: Option<u8>,
	/// The data set was spooled into this Part 10 file instead of being kept in memory.
	pub file: Option<PathBuf>,
}

impl Debug for DicomMessage {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match (&self.data, &self.file) {
			(Some(_), _) => write!(f, "DicomMessage {{ command, data }}"),
			(None, Some(file)) => write!(f, "DicomMessage {{ command, file: {} }}", file.display()),
			(None, None) => write!(f, "DicomMessage {{ command }}"),
		}
	}
}

impl DicomMessage {
	pub const fn new(command: InMemDicomObject, data: Option<InMemDicomObject>) -> Self {
		Self {
			command,
			data,
			presentation_context_id: None,
			file: None,
		}
	}

	pub fn command_field(&self) -> Option<US> {
		get_int(&self.command, tags::COMMAND_FIELD)
	}

	pub fn message_id(&self) -> Option<US> {
		get_int(&self.command, tags::MESSAGE_ID)
	}

	pub fn affected_sop_class_uid(&self) -> Option<UI> {
		get_str(&self.command, tags::AFFECTED_SOP_CLASS_UID)
	}

	pub fn status(&self) -> Option<US> {
		get_int(&self.command, tags::STATUS)
	}
}

/// Reads an integer attribute, ignoring absent or malformed values.
pub fn get_int(object: &InMemDicomObject, tag: Tag) -> Option<US> {
	object
		.get(tag)
		.map(InMemElement::to_int::<US>)
		.and_then(Result::ok)
}

/// Reads a string attribute with padding removed. Empty values are treated as absent.
pub fn get_str(object: &InMemDicomObject, tag: Tag) -> Option<String> {
	object
		.get(tag)
		.map(InMemElement::to_str)
		.and_then(Result::ok)
		.map(|value| value.trim_matches(|c: char| c == ' ' || c == '\0').to_owned())
		.filter(|value| !value.is_empty())
}

/// Reads a multi-valued string attribute, split at the backslash delimiter.
pub fn get_multi_str(object: &InMemDicomObject, tag: Tag) -> Vec<String> {
	get_str(object, tag)
		.map(|value| {
			value
				.split('\\')
				.map(|part| part.trim().to_owned())
				.filter(|part| !part.is_empty())
				.collect()
		})
		.unwrap_or_default()
}

/// Status types supported by the DIMSE services.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatusType {
	Success,
	Warning,
	Failure,
	Cancel,
	Pending,
}

impl TryFrom<u16> for StatusType {
	type Error = u16;

	/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
	fn try_from(value: u16) -> Result<Self, Self::Error> {
		match value {
			0 => Ok(Self::Success),
			1 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => Ok(Self::Warning),
			0xA000..=0xAFFF | 0xC000..=0xCFFF | 0x0100..=0x01FF | 0x0200..=0x02FF => {
				Ok(Self::Failure)
			}
			0xFE00 => Ok(Self::Cancel),
			0xFF00 | 0xFF01 => Ok(Self::Pending),
			_ => Err(value),
		}
	}
}

pub trait DicomMessageReader {
	async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError>;

	/// Reads the next message. If `spool` returns a path for the received command set,
	/// the data set is written to that path as a Part 10 file while it arrives.
	async fn read_message_spooled<F>(
		&self,
		timeout: Duration,
		spool: F,
	) -> Result<DicomMessage, ReadError>
	where
		F: Fn(&InMemDicomObject) -> Option<PathBuf> + Send;
}

pub trait DicomMessageWriter {
	async fn write_message(
		&self,
		message: impl Into<DicomMessage>,
		presentation_context_id: Option<u8>,
		timeout: Duration,
	) -> Result<(), WriteError>;
}

fn find_presentation_context(
	contexts: &[PresentationContextNegotiated],
	presentation_context_id: Option<u8>,
) -> Result<&PresentationContextNegotiated, NegotiationError> {
	match presentation_context_id {
		None => contexts.first(),
		Some(presentation_context_id) => contexts
			.iter()
			.find(|pctx| pctx.id == presentation_context_id),
	}
	.ok_or(NegotiationError::NoPresentationContext)
}

fn transfer_syntax_of(
	presentation_context: &PresentationContextNegotiated,
) -> Result<&'static dicom::encoding::TransferSyntax, NegotiationError> {
	TransferSyntaxRegistry
		.get(&presentation_context.transfer_syntax)
		.ok_or_else(|| {
			NegotiationError::UnknownTransferSyntax(UI::from(&presentation_context.transfer_syntax))
		})
}

impl<A: Association> DicomMessageWriter for A {
	#[instrument(skip_all)]
	async fn write_message(
		&self,
		message: impl Into<DicomMessage>,
		presentation_context_id: Option<u8>,
		timeout: Duration,
	) -> Result<(), WriteError> {
		let message: DicomMessage = Into::into(message);
		let presentation_context =
			find_presentation_context(self.presentation_contexts(), presentation_context_id)?;

		let mut command_buf = Vec::new();
		message
			.command
			.write_dataset_with_ts(&mut command_buf, &IMPLICIT_VR_LITTLE_ENDIAN.erased())?;

		let command_pdu = Pdu::PData {
			data: vec![PDataValue {
				value_type: PDataValueType::Command,
				presentation_context_id: presentation_context.id,
				is_last: true,
				data: command_buf,
			}],
		};
		self.send(command_pdu, timeout).await?;

		if let Some(data) = message.data {
			let transfer_syntax = transfer_syntax_of(presentation_context)?;
			let mut data_buf = Vec::new();
			data.write_dataset_with_ts(&mut data_buf, transfer_syntax)?;

			let data_pdu = Pdu::PData {
				data: vec![PDataValue {
					value_type: PDataValueType::Data,
					presentation_context_id: presentation_context.id,
					is_last: true,
					data: data_buf,
				}],
			};

			self.send(data_pdu, timeout).await?;
		}

		Ok(())
	}
}

#[derive(Debug, Error)]
pub enum ReadError {
	#[error("Failed to read DICOM object: {0}")]
	Reader(#[from] dicom::object::ReadError),
	#[error("Received unexpected PDU {0:?}")]
	UnexpectedPdu(Pdu),
	#[error("Received fragments out of order")]
	OutOfOrder,
	#[error("Failed to receive PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error("Mandatory attribute is missing")]
	MissingAttribute(Tag),
	#[error("Peer released the association")]
	Released,
	#[error("Peer aborted the association")]
	Aborted,
	#[error("Failed to spool data set to {path}: {source}")]
	Spool {
		path: PathBuf,
		source: std::io::Error,
	},
}

impl ReadError {
	/// Whether the association ended in an orderly way instead of failing.
	pub const fn is_closed(&self) -> bool {
		matches!(self, Self::Released | Self::Aborted)
	}
}

#[derive(Debug, Error)]
pub enum WriteError {
	#[error("Failed to write DICOM object: {0}")]
	Writer(#[from] dicom::object::WriteError),
	#[error("Failed to send PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
	#[error("Unknown transfer syntax with UID '{0}'")]
	UnknownTransferSyntax(UI),
	#[error("Failed to negotiate a presentation context")]
	NoPresentationContext,
}

/// Destination of a data set that is received straight into a file.
/// Dropping an unfinished spool removes the file and its per-operation folder,
/// including when the read is cancelled.
struct Spool {
	path: PathBuf,
	file: Option<tokio::fs::File>,
	finished: bool,
}

impl Spool {
	/// Creates the spool file and writes the preamble and file meta group,
	/// so the data set fragments can be appended as they arrive.
	async fn create(
		path: PathBuf,
		command: &InMemDicomObject,
		transfer_syntax: &str,
	) -> Result<Self, std::io::Error> {
		let sop_class_uid = get_str(command, tags::AFFECTED_SOP_CLASS_UID).unwrap_or_default();
		let sop_instance_uid =
			get_str(command, tags::AFFECTED_SOP_INSTANCE_UID).unwrap_or_default();
		let meta = FileMetaTableBuilder::new()
			.media_storage_sop_class_uid(sop_class_uid)
			.media_storage_sop_instance_uid(sop_instance_uid)
			.transfer_syntax(transfer_syntax)
			.build()
			.map_err(|err| std::io::Error::other(err.to_string()))?;

		let mut header = vec![0_u8; 128];
		meta.write(&mut header)
			.map_err(|err| std::io::Error::other(err.to_string()))?;

		if let Some(parent) = path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		let mut spool = Self {
			file: Some(tokio::fs::File::create(&path).await?),
			path,
			finished: false,
		};
		spool.append(&header).await?;
		Ok(spool)
	}

	async fn append(&mut self, fragment: &[u8]) -> Result<(), std::io::Error> {
		match self.file.as_mut() {
			Some(file) => file.write_all(fragment).await,
			None => Err(std::io::Error::other("Spool file is closed")),
		}
	}

	async fn finish(mut self) -> Result<PathBuf, std::io::Error> {
		if let Some(mut file) = self.file.take() {
			file.flush().await?;
			file.sync_all().await?;
		}
		self.finished = true;
		Ok(self.path.clone())
	}
}

impl Drop for Spool {
	fn drop(&mut self) {
		if self.finished {
			return;
		}
		drop(self.file.take());
		if let Err(err) = std::fs::remove_file(&self.path) {
			warn!(path = %self.path.display(), "Failed to remove incomplete spool file: {err}");
		}
		if let Some(folder) = self.path.parent() {
			// Only the per-operation folder is removed, and only once it is empty.
			let _ = std::fs::remove_dir(folder);
		}
	}
}

impl<A: Association> DicomMessageReader for A {
	async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError> {
		self.read_message_spooled(timeout, |_| None).await
	}

	#[instrument(skip_all)]
	async fn read_message_spooled<F>(
		&self,
		timeout: Duration,
		spool: F,
	) -> Result<DicomMessage, ReadError>
	where
		F: Fn(&InMemDicomObject) -> Option<PathBuf> + Send,
	{
		let mut command_fragments = Vec::new();
		let mut data_fragments = Vec::new();
		let mut message_command: Option<InMemDicomObject> = None;
		let mut spooled: Option<Spool> = None;

		let result = async {
			loop {
				let pdu = self.receive(timeout).await?;
				let data = match pdu {
					Pdu::PData { data } => data,
					Pdu::ReleaseRQ => return Err(ReadError::Released),
					Pdu::AbortRQ { .. } => return Err(ReadError::Aborted),
					pdu => return Err(ReadError::UnexpectedPdu(pdu)),
				};

				for mut pdv in data {
					match pdv.value_type {
						PDataValueType::Command => {
							trace!("Received command fragment (last={})", pdv.is_last);
							if message_command.is_some() {
								// Already received the full command set.
								// Receiving another command fragment is not expected.
								return Err(ReadError::OutOfOrder);
							}
							command_fragments.append(&mut pdv.data);
							if pdv.is_last {
								let command = InMemDicomObject::read_dataset_with_ts(
									command_fragments.as_slice(),
									&IMPLICIT_VR_LITTLE_ENDIAN.erased(),
								)?;
								let has_data_set = get_int(&command, tags::COMMAND_DATA_SET_TYPE)
									.is_some_and(|value| value != DATA_SET_MISSING);

								if !has_data_set {
									return Ok(DicomMessage {
										command,
										data: None,
										presentation_context_id: Some(pdv.presentation_context_id),
										file: None,
									});
								}

								if let Some(path) = spool(&command) {
									let presentation_context = find_presentation_context(
										self.presentation_contexts(),
										Some(pdv.presentation_context_id),
									)?;
									let target = Spool::create(
										path.clone(),
										&command,
										&presentation_context.transfer_syntax,
									)
									.await
									.map_err(|source| ReadError::Spool { path, source })?;
									spooled = Some(target);
								}
								message_command = Some(command);
							}
						}
						PDataValueType::Data => {
							trace!("Received data fragment (last={})", pdv.is_last);
							let Some(command) = message_command.take() else {
								// Cannot handle data fragments before the entire command set is received.
								return Err(ReadError::OutOfOrder);
							};

							if let Some(target) = spooled.as_mut() {
								target.append(&pdv.data).await.map_err(|source| {
									ReadError::Spool {
										path: target.path.clone(),
										source,
									}
								})?;
							} else {
								data_fragments.append(&mut pdv.data);
							}

							if !pdv.is_last {
								message_command = Some(command);
								continue;
							}

							if let Some(target) = spooled.take() {
								let path = target.path.clone();
								let file = target
									.finish()
									.await
									.map_err(|source| ReadError::Spool { path, source })?;
								return Ok(DicomMessage {
									command,
									data: None,
									presentation_context_id: Some(pdv.presentation_context_id),
									file: Some(file),
								});
							}

							let presentation_context = find_presentation_context(
								self.presentation_contexts(),
								Some(pdv.presentation_context_id),
							)?;
							let transfer_syntax = transfer_syntax_of(presentation_context)?;
							let data = InMemDicomObject::read_dataset_with_ts(
								data_fragments.as_slice(),
								transfer_syntax,
							)?;

							return Ok(DicomMessage {
								command,
								data: Some(data),
								presentation_context_id: Some(pdv.presentation_context_id),
								file: None,
							});
						}
					}
				}
			}
		}
		.await;

		// An unfinished spool is discarded on drop.
		drop(spooled);
		result
	}
}

/// Builds the response to a request that is answered without reaching a provider,
/// e.g. an unrecognized operation or a request on a refused presentation context.
/// Returns `None` for C-CANCEL-RQ, which has no response.
#[rustfmt::skip]
pub fn failure_response(request: &DicomMessage, status: US, comment: Option<&str>) -> Option<DicomMessage> {
	let command_field = request.command_field()?;
	if command_field == ccancel::COMMAND_FIELD_COMPOSITE_CANCEL_REQUEST || command_field & 0x8000 != 0 {
		return None;
	}
	let mut command = InMemDicomObject::command_from_element_iter([
		DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [command_field | 0x8000])),
		DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [request.message_id().unwrap_or_default()])),
		DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
		DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
	]);
	if let Some(sop_class_uid) = request.affected_sop_class_uid() {
		command.put_element(DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, sop_class_uid)));
	}
	if let Some(sop_instance_uid) = get_str(&request.command, tags::AFFECTED_SOP_INSTANCE_UID) {
		command.put_element(DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, sop_instance_uid)));
	}
	if let Some(comment) = comment {
		command.put_element(DataElement::new(tags::ERROR_COMMENT, VR::LO, dicom_value!(Str, cstore::truncate_comment(comment.to_owned()))));
	}
	Some(DicomMessage::new(command, None))
}

/// Returns a new message id by incrementing a global counter.
pub fn next_message_id() -> US {
	static CURRENT_MSG_ID: AtomicU16 = AtomicU16::new(1);
	CURRENT_MSG_ID.fetch_add(1, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::ul::pdu::{AbortRQSource, PresentationContextResultReason};
	use std::collections::VecDeque;
	use std::future::Future;
	use std::sync::Mutex;
	use tokio::sync::Notify;

	const CT_ENHANCED: &str = "1.2.840.10008.5.1.4.1.1.2.1";

	/// Replays a fixed list of PDUs, then stays silent.
	struct ScriptedAssociation {
		pdus: Mutex<VecDeque<Pdu>>,
		contexts: Vec<PresentationContextNegotiated>,
		idle: Notify,
	}

	impl ScriptedAssociation {
		fn new(pdus: Vec<Pdu>) -> Self {
			Self {
				pdus: Mutex::new(pdus.into()),
				contexts: vec![PresentationContextNegotiated {
					id: 1,
					reason: PresentationContextResultReason::Acceptance,
					abstract_syntax: String::from(CT_ENHANCED),
					transfer_syntax: String::from(IMPLICIT_VR_LITTLE_ENDIAN.uid()),
				}],
				idle: Notify::new(),
			}
		}
	}

	impl Association for ScriptedAssociation {
		fn receive(
			&self,
			_timeout: Duration,
		) -> impl Future<Output = Result<Pdu, AssociationError>> + Send {
			let next = self.pdus.lock().unwrap().pop_front();
			if next.is_none() {
				self.idle.notify_one();
			}
			async move {
				match next {
					Some(pdu) => Ok(pdu),
					None => std::future::pending().await,
				}
			}
		}

		fn send(
			&self,
			_pdu: Pdu,
			_timeout: Duration,
		) -> impl Future<Output = Result<(), AssociationError>> + Send {
			async { Ok(()) }
		}

		fn close(&mut self) {}

		fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
			&self.contexts
		}
	}

	fn store_command() -> Pdu {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, CT_ENHANCED)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [cstore::COMMAND_FIELD_COMPOSITE_STORE_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [1])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, "1.2.3.4")),
		]);
		let mut data = Vec::new();
		command
			.write_dataset_with_ts(&mut data, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
			.unwrap();
		Pdu::PData {
			data: vec![PDataValue {
				value_type: PDataValueType::Command,
				presentation_context_id: 1,
				is_last: true,
				data,
			}],
		}
	}

	fn partial_data_set() -> Pdu {
		Pdu::PData {
			data: vec![PDataValue {
				value_type: PDataValueType::Data,
				presentation_context_id: 1,
				is_last: false,
				data: vec![0x08, 0x00, 0x16, 0x00, 0x00, 0x00, 0x00, 0x00],
			}],
		}
	}

	#[test]
	fn classify_status() {
		assert_eq!(StatusType::try_from(status::SUCCESS), Ok(StatusType::Success));
		assert_eq!(StatusType::try_from(status::PENDING), Ok(StatusType::Pending));
		assert_eq!(StatusType::try_from(status::CANCEL), Ok(StatusType::Cancel));
		assert_eq!(
			StatusType::try_from(status::SUB_OPERATIONS_ONE_OR_MORE_FAILURES),
			Ok(StatusType::Warning)
		);
		assert_eq!(
			StatusType::try_from(status::UNABLE_TO_PROCESS),
			Ok(StatusType::Failure)
		);
		assert_eq!(
			StatusType::try_from(status::MOVE_DESTINATION_UNKNOWN),
			Ok(StatusType::Failure)
		);
		assert_eq!(StatusType::try_from(0x9000), Err(0x9000));
	}

	#[test]
	fn string_values_are_trimmed() {
		let object = InMemDicomObject::from_element_iter([
			DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, "1.2.3\0")),
			DataElement::new(tags::MODALITIES_IN_STUDY, VR::CS, dicom_value!(Str, "CT\\MR ")),
			DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, "  ")),
		]);
		assert_eq!(
			get_str(&object, tags::STUDY_INSTANCE_UID).as_deref(),
			Some("1.2.3")
		);
		assert_eq!(get_str(&object, tags::PATIENT_ID), None);
		assert_eq!(
			get_multi_str(&object, tags::MODALITIES_IN_STUDY),
			vec![String::from("CT"), String::from("MR")]
		);
	}

	#[test]
	fn unrecognized_requests_get_a_matching_response() {
		let request = DicomMessage::new(
			InMemDicomObject::command_from_element_iter([
				DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, "1.2.840.10008.5.1.4.1.2.2.1")),
				DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [cfind::COMMAND_FIELD_COMPOSITE_FIND_REQUEST])),
				DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [7])),
			]),
			None,
		);
		let response = failure_response(&request, status::REFUSED_NOT_AUTHORIZED, Some("Not permitted"))
			.expect("find requests have a response");
		assert_eq!(response.command_field(), Some(cfind::COMMAND_FIELD_COMPOSITE_FIND_RESPONSE));
		assert_eq!(response.status(), Some(status::REFUSED_NOT_AUTHORIZED));
		assert_eq!(get_int(&response.command, tags::MESSAGE_ID_BEING_RESPONDED_TO), Some(7));
		assert_eq!(get_str(&response.command, tags::ERROR_COMMENT).as_deref(), Some("Not permitted"));
	}

	#[test]
	fn cancel_requests_have_no_response() {
		let request = DicomMessage::new(
			InMemDicomObject::command_from_element_iter([DataElement::new(
				tags::COMMAND_FIELD,
				VR::US,
				dicom_value!(U16, [ccancel::COMMAND_FIELD_COMPOSITE_CANCEL_REQUEST]),
			)]),
			None,
		);
		assert!(failure_response(&request, status::UNRECOGNIZED_OPERATION, None).is_none());
	}

	#[tokio::test]
	async fn aborted_spool_removes_file_and_folder() {
		let dir = tempfile::tempdir().unwrap();
		let folder = dir.path().join("operation");
		let file = folder.join("1.2.3.4.dcm");
		let association = ScriptedAssociation::new(vec![
			store_command(),
			partial_data_set(),
			Pdu::AbortRQ {
				source: AbortRQSource::ServiceUser,
			},
		]);

		let result = association
			.read_message_spooled(Duration::from_secs(1), |_| Some(file.clone()))
			.await;

		assert!(matches!(result, Err(ReadError::Aborted)));
		assert!(!file.exists());
		assert!(!folder.exists());
	}

	#[tokio::test]
	async fn cancelled_read_removes_spooled_data() {
		let dir = tempfile::tempdir().unwrap();
		let folder = dir.path().join("operation");
		let file = folder.join("1.2.3.4.dcm");
		let association = ScriptedAssociation::new(vec![store_command(), partial_data_set()]);

		let mut read = Box::pin(
			association.read_message_spooled(Duration::from_secs(1), |_| Some(file.clone())),
		);
		tokio::select! {
			_ = &mut read => panic!("the data set is incomplete"),
			() = association.idle.notified() => {}
		}
		assert!(file.exists());

		drop(read);
		assert!(!file.exists());
		assert!(!folder.exists());
	}
}
