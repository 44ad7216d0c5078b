use crate::dimse::{
	get_int, get_str, DicomMessage, ReadError, DATA_SET_EXISTS, DATA_SET_MISSING,
};
use crate::types::{UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_FIND_REQUEST: US = 0x0020;
pub const COMMAND_FIELD_COMPOSITE_FIND_RESPONSE: US = 0x8020;

/// C-FIND-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_9.html#table_9.1-2>
pub struct CompositeFindRequest {
	pub message_id: US,
	pub priority: US,
	pub affected_sop_class_uid: UI,
	pub identifier: InMemDicomObject,
}

impl TryFrom<DicomMessage> for CompositeFindRequest {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		Ok(Self {
			message_id: get_int(&message.command, tags::MESSAGE_ID)
				.ok_or(ReadError::MissingAttribute(tags::MESSAGE_ID))?,
			priority: get_int(&message.command, tags::PRIORITY).unwrap_or_default(),
			affected_sop_class_uid: get_str(&message.command, tags::AFFECTED_SOP_CLASS_UID)
				.ok_or(ReadError::MissingAttribute(tags::AFFECTED_SOP_CLASS_UID))?,
			identifier: message
				.data
				.ok_or(ReadError::MissingAttribute(tags::COMMAND_DATA_SET_TYPE))?,
		})
	}
}

/// C-FIND-RSP
#[derive(Debug)]
pub struct CompositeFindResponse {
	pub message_id: US,
	pub sop_class_uid: UI,
	pub status: US,
	pub identifier: Option<InMemDicomObject>,
	pub error_comment: Option<String>,
}

impl CompositeFindResponse {
	pub fn new(message_id: US, sop_class_uid: impl Into<UI>, status: US) -> Self {
		Self {
			message_id,
			sop_class_uid: sop_class_uid.into(),
			status,
			identifier: None,
			error_comment: None,
		}
	}

	#[must_use]
	pub fn identifier(mut self, identifier: InMemDicomObject) -> Self {
		self.identifier = Some(identifier);
		self
	}

	#[must_use]
	pub fn error_comment(mut self, comment: impl Into<String>) -> Self {
		self.error_comment = Some(comment.into());
		self
	}
}

impl From<CompositeFindResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeFindResponse) -> Self {
		let data_set_type = if response.identifier.is_some() { DATA_SET_EXISTS } else { DATA_SET_MISSING };
		let mut command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_FIND_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [data_set_type])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
		]);

		if let Some(comment) = response.error_comment {
			command.put_element(DataElement::new(tags::ERROR_COMMENT, VR::LO, dicom_value!(Str, super::cstore::truncate_comment(comment))));
		}

		Self::new(command, response.identifier)
	}
}
