use super::{PresentationVerdict, ScpRequest, ServiceClassProvider, ServiceType};
use crate::dimse::cecho::{CompositeEchoResponse, COMMAND_FIELD_COMPOSITE_ECHO_REQUEST};
use crate::dimse::ReadError;
use crate::store::{Device, Partition};
use crate::types::{UI, US};
use async_trait::async_trait;
use dicom::dictionary_std::{tags, uids};
use tracing::debug;

pub struct VerificationServiceProvider;

#[async_trait]
impl ServiceClassProvider for VerificationServiceProvider {
	fn service_type(&self) -> ServiceType {
		ServiceType::Verification
	}

	fn command_fields(&self) -> &'static [US] {
		&[COMMAND_FIELD_COMPOSITE_ECHO_REQUEST]
	}

	fn supported_sop_classes(&self, _partition: &Partition) -> Vec<UI> {
		vec![UI::from(uids::VERIFICATION)]
	}

	fn verify_presentation_context(
		&self,
		_partition: &Partition,
		_device: Option<&Device>,
		_abstract_syntax: &str,
	) -> PresentationVerdict {
		PresentationVerdict::Accept
	}

	async fn on_receive_request(&self, request: ScpRequest) -> anyhow::Result<()> {
		let message_id = request
			.message
			.message_id()
			.ok_or(ReadError::MissingAttribute(tags::MESSAGE_ID))?;
		debug!(calling_ae = %request.context.calling_ae, "Received C-ECHO-RQ");
		request
			.writer
			.write(
				CompositeEchoResponse::success(message_id).into(),
				request.message.presentation_context_id,
			)
			.await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dimse::{status, DicomMessage};
	use crate::scp::tests::{association, RecordingWriter};
	use crate::scp::ResponseWriter;
	use dicom::core::{DataElement, VR};
	use dicom::dicom_value;
	use dicom::object::InMemDicomObject;
	use std::sync::Arc;
	use tokio_util::sync::CancellationToken;

	#[tokio::test]
	async fn echo_is_answered_with_success() {
		let writer = Arc::new(RecordingWriter::default());
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_ECHO_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [9])),
		]);
		let mut message = DicomMessage::new(command, None);
		message.presentation_context_id = Some(1);

		VerificationServiceProvider
			.on_receive_request(ScpRequest {
				context: Arc::new(association(None, Vec::new())),
				message,
				writer: Arc::clone(&writer) as Arc<dyn ResponseWriter>,
				cancel: CancellationToken::new(),
			})
			.await
			.unwrap();

		assert_eq!(writer.statuses(), vec![status::SUCCESS]);
		assert_eq!(writer.int(0, tags::MESSAGE_ID_BEING_RESPONDED_TO), Some(9));
	}
}
