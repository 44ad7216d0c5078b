use crate::dimse::{get_int, DicomMessage, ReadError};
use crate::types::US;
use dicom::dictionary_std::tags;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_CANCEL_REQUEST: US = 0x0FFF;

/// C-CANCEL-RQ. Identifies the pending C-FIND, C-GET or C-MOVE to abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositeCancelRequest {
	pub message_id_being_responded_to: US,
}

impl TryFrom<&DicomMessage> for CompositeCancelRequest {
	type Error = ReadError;

	fn try_from(message: &DicomMessage) -> Result<Self, Self::Error> {
		let message_id_being_responded_to =
			get_int(&message.command, tags::MESSAGE_ID_BEING_RESPONDED_TO)
				.ok_or(ReadError::MissingAttribute(tags::MESSAGE_ID_BEING_RESPONDED_TO))?;
		Ok(Self {
			message_id_being_responded_to,
		})
	}
}
