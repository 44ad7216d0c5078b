use crate::dimse::{
	get_int, get_str, DicomMessage, ReadError, DATA_SET_EXISTS, DATA_SET_MISSING,
};
use crate::types::{AE, UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_MOVE_REQUEST: US = 0x0021;
pub const COMMAND_FIELD_COMPOSITE_MOVE_RESPONSE: US = 0x8021;

/// C-MOVE-RQ
pub struct CompositeMoveRequest {
	pub identifier: InMemDicomObject,
	pub message_id: US,
	pub priority: US,
	pub affected_sop_class_uid: UI,
	pub destination: AE,
}

impl TryFrom<DicomMessage> for CompositeMoveRequest {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		Ok(Self {
			message_id: get_int(&message.command, tags::MESSAGE_ID)
				.ok_or(ReadError::MissingAttribute(tags::MESSAGE_ID))?,
			priority: get_int(&message.command, tags::PRIORITY).unwrap_or_default(),
			affected_sop_class_uid: get_str(&message.command, tags::AFFECTED_SOP_CLASS_UID)
				.ok_or(ReadError::MissingAttribute(tags::AFFECTED_SOP_CLASS_UID))?,
			destination: get_str(&message.command, tags::MOVE_DESTINATION)
				.ok_or(ReadError::MissingAttribute(tags::MOVE_DESTINATION))?,
			identifier: message
				.data
				.ok_or(ReadError::MissingAttribute(tags::COMMAND_DATA_SET_TYPE))?,
		})
	}
}

impl From<CompositeMoveRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeMoveRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_MOVE_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
			DataElement::new(tags::MOVE_DESTINATION, VR::AE, dicom_value!(Str, request.destination)),
		]);

		Self::new(command, Some(request.identifier))
	}
}

/// Sub-operation counters of a C-MOVE-RSP.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SubOperations {
	pub remaining: US,
	pub completed: US,
	pub failed: US,
	pub warning: US,
}

/// C-MOVE-RSP
pub struct CompositeMoveResponse {
	pub message_id: US,
	pub sop_class_uid: UI,
	pub status: US,
	pub sub_operations: SubOperations,
	/// Carried in the identifier as Failed SOP Instance UID List (0008,0058).
	pub failed_sop_instance_uids: Vec<UI>,
	pub error_comment: Option<String>,
}

impl CompositeMoveResponse {
	pub fn new(message_id: US, sop_class_uid: impl Into<UI>, status: US) -> Self {
		Self {
			message_id,
			sop_class_uid: sop_class_uid.into(),
			status,
			sub_operations: SubOperations::default(),
			failed_sop_instance_uids: Vec::new(),
			error_comment: None,
		}
	}

	#[must_use]
	pub const fn sub_operations(mut self, sub_operations: SubOperations) -> Self {
		self.sub_operations = sub_operations;
		self
	}

	#[must_use]
	pub fn failed_sop_instance_uids(mut self, uids: Vec<UI>) -> Self {
		self.failed_sop_instance_uids = uids;
		self
	}

	#[must_use]
	pub fn error_comment(mut self, comment: impl Into<String>) -> Self {
		self.error_comment = Some(comment.into());
		self
	}
}

impl From<CompositeMoveResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeMoveResponse) -> Self {
		let identifier = if response.failed_sop_instance_uids.is_empty() {
			None
		} else {
			Some(InMemDicomObject::from_element_iter([
				DataElement::new(tags::FAILED_SOP_INSTANCE_UID_LIST, VR::UI, dicom_value!(Str, response.failed_sop_instance_uids.join("\\"))),
			]))
		};
		let data_set_type = if identifier.is_some() { DATA_SET_EXISTS } else { DATA_SET_MISSING };
		let counters = response.sub_operations;

		let mut command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_MOVE_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [data_set_type])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
			DataElement::new(tags::NUMBER_OF_REMAINING_SUBOPERATIONS, VR::US, dicom_value!(U16, [counters.remaining])),
			DataElement::new(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, VR::US, dicom_value!(U16, [counters.completed])),
			DataElement::new(tags::NUMBER_OF_FAILED_SUBOPERATIONS, VR::US, dicom_value!(U16, [counters.failed])),
			DataElement::new(tags::NUMBER_OF_WARNING_SUBOPERATIONS, VR::US, dicom_value!(U16, [counters.warning])),
		]);

		if let Some(comment) = response.error_comment {
			command.put_element(DataElement::new(tags::ERROR_COMMENT, VR::LO, dicom_value!(Str, super::cstore::truncate_comment(comment))));
		}

		Self::new(command, identifier)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dimse::{get_multi_str, status};

	#[test]
	fn failed_uids_travel_in_identifier() {
		let message: DicomMessage = CompositeMoveResponse::new(5, "1.2", status::SUB_OPERATIONS_ONE_OR_MORE_FAILURES)
			.sub_operations(SubOperations {
				remaining: 0,
				completed: 2,
				failed: 1,
				warning: 0,
			})
			.failed_sop_instance_uids(vec![UI::from("1.2.3")])
			.into();

		assert_eq!(get_int(&message.command, tags::COMMAND_DATA_SET_TYPE), Some(DATA_SET_EXISTS));
		assert_eq!(get_int(&message.command, tags::NUMBER_OF_COMPLETED_SUBOPERATIONS), Some(2));
		let identifier = message.data.expect("identifier with failed uids");
		assert_eq!(
			get_multi_str(&identifier, tags::FAILED_SOP_INSTANCE_UID_LIST),
			vec![UI::from("1.2.3")]
		);
	}

	#[test]
	fn success_without_failures_has_no_identifier() {
		let message: DicomMessage = CompositeMoveResponse::new(5, "1.2", status::SUCCESS).into();
		assert!(message.data.is_none());
		assert_eq!(get_int(&message.command, tags::COMMAND_DATA_SET_TYPE), Some(DATA_SET_MISSING));
	}
}
