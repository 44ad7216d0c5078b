use crate::dimse::{
	get_int, get_str, status, DicomMessage, ReadError, DATA_SET_EXISTS, DATA_SET_MISSING,
};
use crate::types::{AE, UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_STORE_REQUEST: US = 0x0001;
pub const COMMAND_FIELD_COMPOSITE_STORE_RESPONSE: US = 0x8001;

/// C-STORE-RQ
pub struct CompositeStoreRequest {
	pub affected_sop_class_uid: UI,
	pub affected_sop_instance_uid: UI,
	pub move_originator_aet: Option<AE>,
	pub move_originator_message_id: Option<US>,
	pub message_id: US,
	pub priority: US,
	pub data_set: InMemDicomObject,
}

impl From<CompositeStoreRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeStoreRequest) -> Self {
		let mut command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_STORE_REQUEST])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, request.affected_sop_instance_uid)),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
		]);

		if let Some(move_originator_message_id) = request.move_originator_message_id {
			command.put_element(DataElement::new(tags::MOVE_ORIGINATOR_MESSAGE_ID, VR::US, dicom_value!(U16, [move_originator_message_id])));
		}

		if let Some(move_originator_aet) = request.move_originator_aet {
			command.put_element(DataElement::new(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE, VR::AE, dicom_value!(Str, move_originator_aet)));
		}

		Self::new(command, Some(request.data_set))
	}
}

/// The command set of a received C-STORE-RQ. The data set stays with the [`DicomMessage`],
/// as it may have been spooled into a file.
#[derive(Debug, Clone)]
pub struct StoreCommand {
	pub message_id: US,
	pub affected_sop_class_uid: UI,
	pub affected_sop_instance_uid: UI,
	pub move_originator_aet: Option<AE>,
}

impl TryFrom<&DicomMessage> for StoreCommand {
	type Error = ReadError;

	fn try_from(message: &DicomMessage) -> Result<Self, Self::Error> {
		Ok(Self {
			message_id: get_int(&message.command, tags::MESSAGE_ID)
				.ok_or(ReadError::MissingAttribute(tags::MESSAGE_ID))?,
			affected_sop_class_uid: get_str(&message.command, tags::AFFECTED_SOP_CLASS_UID)
				.ok_or(ReadError::MissingAttribute(tags::AFFECTED_SOP_CLASS_UID))?,
			affected_sop_instance_uid: get_str(&message.command, tags::AFFECTED_SOP_INSTANCE_UID)
				.ok_or(ReadError::MissingAttribute(tags::AFFECTED_SOP_INSTANCE_UID))?,
			move_originator_aet: get_str(
				&message.command,
				tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE,
			),
		})
	}
}

/// C-STORE-RSP
pub struct CompositeStoreResponse {
	pub message_id: US,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub status: US,
	pub error_comment: Option<String>,
}

impl CompositeStoreResponse {
	pub fn new(command: &StoreCommand, status: US) -> Self {
		Self {
			message_id: command.message_id,
			sop_class_uid: command.affected_sop_class_uid.clone(),
			sop_instance_uid: command.affected_sop_instance_uid.clone(),
			status,
			error_comment: None,
		}
	}

	pub fn success(command: &StoreCommand) -> Self {
		Self::new(command, status::SUCCESS)
	}

	#[must_use]
	pub fn error_comment(mut self, comment: impl Into<String>) -> Self {
		self.error_comment = Some(comment.into());
		self
	}
}

impl From<CompositeStoreResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeStoreResponse) -> Self {
		let mut command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_STORE_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, response.sop_instance_uid)),
		]);

		if let Some(comment) = response.error_comment {
			command.put_element(DataElement::new(tags::ERROR_COMMENT, VR::LO, dicom_value!(Str, truncate_comment(comment))));
		}

		Self::new(command, None)
	}
}

/// Error Comment (0000,0902) is a LO and limited to 64 characters.
pub fn truncate_comment(comment: String) -> String {
	if comment.chars().count() <= 64 {
		comment
	} else {
		comment.chars().take(64).collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dimse::get_str;

	#[test]
	fn response_carries_status_and_comment() {
		let command = StoreCommand {
			message_id: 7,
			affected_sop_class_uid: UI::from("1.2.840.10008.5.1.4.1.1.2"),
			affected_sop_instance_uid: UI::from("1.2.3.4"),
			move_originator_aet: None,
		};
		let message: DicomMessage = CompositeStoreResponse::new(&command, status::PROCESSING_FAILURE)
			.error_comment("x".repeat(100))
			.into();

		assert_eq!(message.status(), Some(status::PROCESSING_FAILURE));
		assert_eq!(get_int(&message.command, tags::MESSAGE_ID_BEING_RESPONDED_TO), Some(7));
		assert_eq!(
			get_str(&message.command, tags::ERROR_COMMENT).map(|c| c.len()),
			Some(64)
		);
	}

	#[test]
	fn parse_request_command() {
		let message: DicomMessage = CompositeStoreRequest {
			affected_sop_class_uid: UI::from("1.2.840.10008.5.1.4.1.1.4"),
			affected_sop_instance_uid: UI::from("1.2.3.4.5"),
			move_originator_aet: Some(AE::from("MOVER")),
			move_originator_message_id: Some(3),
			message_id: 11,
			priority: 0,
			data_set: InMemDicomObject::new_empty(),
		}
		.into();

		let command = StoreCommand::try_from(&message).expect("valid C-STORE-RQ");
		assert_eq!(command.message_id, 11);
		assert_eq!(command.affected_sop_instance_uid, "1.2.3.4.5");
		assert_eq!(command.move_originator_aet.as_deref(), Some("MOVER"));
	}
}
