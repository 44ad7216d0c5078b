use super::{is_native, Connector, ForwardError, ForwardTarget, InstanceSender, MoveOriginator, StorageInstance};
use crate::dimse::association::client::{ClientAssociation, ClientAssociationOptions, ProposedContext};
use crate::dimse::association::Association;
use crate::dimse::cstore::CompositeStoreRequest;
use crate::dimse::{next_message_id, status, DicomMessageReader, DicomMessageWriter};
use crate::types::{Priority, UI, US};
use async_trait::async_trait;
use dicom::object::OpenFileOptions;
use std::time::Duration;
use tracing::{debug, trace};

/// Connects to move destinations with a dicom-ul client association.
pub struct DimseConnector {
	timeout: Duration,
	max_pdu_length: u32,
}

impl DimseConnector {
	pub const fn new(timeout: Duration, max_pdu_length: u32) -> Self {
		Self {
			timeout,
			max_pdu_length,
		}
	}
}

#[async_trait]
impl Connector for DimseConnector {
	async fn connect(
		&self,
		calling_ae: &str,
		target: &ForwardTarget,
		contexts: Vec<ProposedContext>,
	) -> Result<Box<dyn InstanceSender>, ForwardError> {
		let association = ClientAssociation::new(ClientAssociationOptions {
			calling_aet: calling_ae.to_owned(),
			called_aet: target.device.ae_title.clone(),
			presentation_contexts: contexts,
			address: target.address,
			timeout: self.timeout,
			max_pdu_length: self.max_pdu_length,
		})
		.await?;
		debug!(
			association = %association.uuid(),
			accepted = association.presentation_contexts().len(),
			"Connected to move destination"
		);
		Ok(Box::new(DimseSender {
			association,
			timeout: self.timeout,
		}))
	}
}

struct DimseSender {
	association: ClientAssociation,
	timeout: Duration,
}

#[async_trait]
impl InstanceSender for DimseSender {
	async fn send(
		&mut self,
		instance: &StorageInstance,
		originator: Option<&MoveOriginator>,
	) -> Result<US, ForwardError> {
		let context = self
			.association
			.presentation_contexts()
			.iter()
			.find(|context| context.abstract_syntax.trim_end_matches('\0') == instance.sop_class_uid)
			.ok_or_else(|| ForwardError::NoPresentationContext(instance.sop_class_uid.clone()))?;
		let presentation_context_id = context.id;
		let negotiated = context.transfer_syntax.trim_end_matches('\0');
		if negotiated != instance.transfer_syntax_uid
			&& !(is_native(negotiated) && is_native(&instance.transfer_syntax_uid))
		{
			return Err(ForwardError::TransferSyntax {
				stored: instance.transfer_syntax_uid.clone(),
				negotiated: UI::from(negotiated),
			});
		}

		let path = instance.path.clone();
		let file = tokio::task::spawn_blocking(move || {
			OpenFileOptions::new()
				.open_file(&path)
				.map_err(|source| ForwardError::File { path, source })
		})
		.await??;
		trace!(path = %instance.path.display(), "Loaded instance for forwarding");

		let request = CompositeStoreRequest {
			affected_sop_class_uid: instance.sop_class_uid.clone(),
			affected_sop_instance_uid: instance.sop_instance_uid.clone(),
			move_originator_aet: originator.map(|originator| originator.ae_title.clone()),
			move_originator_message_id: originator.map(|originator| originator.message_id),
			message_id: next_message_id(),
			priority: Priority::Medium as US,
			data_set: file.into_inner(),
		};
		self.association
			.write_message(request, Some(presentation_context_id), self.timeout)
			.await?;
		let response = self.association.read_message(self.timeout).await?;
		Ok(response.status().unwrap_or(status::PROCESSING_FAILURE))
	}

	async fn release(self: Box<Self>) {
		let Self {
			association,
			timeout,
		} = *self;
		if let Err(err) = association.release(timeout).await {
			debug!("Failed to release association to move destination: {err}");
		}
	}
}
