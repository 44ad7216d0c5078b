use dicom::ul::pdu::PresentationContextNegotiated;
use dicom::ul::Pdu;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;

pub mod client;
pub mod server;

#[derive(Debug, Error)]
pub enum AssociationError {
	#[error(transparent)]
	Channel(#[from] ChannelError),
	#[error("Failed to spawn thread")]
	OsThread(std::io::Error),
	#[error("Failed to write P-DATA chunk: {0}")]
	ChunkWriter(std::io::Error),
	#[error("Failed to write PDU: {0}")]
	Wire(String),
	#[error(transparent)]
	Association(#[from] dicom::ul::association::Error),
	#[error("Timed out while establishing the association")]
	EstablishTimeout,
}

pub trait Association {
	fn receive(
		&self,
		timeout: Duration,
	) -> impl Future<Output = Result<Pdu, AssociationError>> + Send;

	fn send(
		&self,
		pdu: Pdu,
		timeout: Duration,
	) -> impl Future<Output = Result<(), AssociationError>> + Send;

	fn close(&mut self);

	fn presentation_contexts(&self) -> &[PresentationContextNegotiated];
}

#[derive(Debug)]
pub enum Command {
	Send(Pdu, oneshot::Sender<Result<(), AssociationError>>),
	Receive(oneshot::Sender<Result<Pdu, AssociationError>>),
	Release(oneshot::Sender<Result<(), AssociationError>>),
}

#[derive(Debug, Error)]
pub enum ChannelError {
	#[error("Timed out")]
	Timeout,
	#[error("Channel is closed")]
	Closed,
}

pub trait AskPattern<T> {
	async fn ask<R>(
		&self,
		command: impl FnOnce(oneshot::Sender<R>) -> T,
		timeout: Duration,
	) -> Result<R, ChannelError>;
}

impl<T> AskPattern<T> for Sender<T> {
	async fn ask<R>(
		&self,
		command: impl FnOnce(oneshot::Sender<R>) -> T,
		timeout: Duration,
	) -> Result<R, ChannelError> {
		let (tx, rx) = oneshot::channel();
		tokio::time::timeout(timeout, async {
			self.send(command(tx))
				.await
				.map_err(|_| ChannelError::Closed)?;

			rx.await.map_err(|_| ChannelError::Closed)
		})
		.await
		.map_err(|_| ChannelError::Timeout)?
	}
}

/// Splits the data values of a P-DATA PDU so that no PDU exceeds `max_pdu_length`.
/// Command fragments are never split.
pub fn fragment_pdata(pdu: Pdu, max_pdu_length: u32) -> Vec<Pdu> {
	// PDU header (6) + PDV item header (6)
	let max_fragment = (max_pdu_length as usize).saturating_sub(12).max(1);
	match pdu {
		Pdu::PData { data } => {
			let mut pdus = Vec::new();
			for pdv in data {
				if pdv.data.len() <= max_fragment {
					pdus.push(Pdu::PData { data: vec![pdv] });
					continue;
				}
				let chunks: Vec<&[u8]> = pdv.data.chunks(max_fragment).collect();
				let last = chunks.len() - 1;
				for (index, chunk) in chunks.into_iter().enumerate() {
					pdus.push(Pdu::PData {
						data: vec![dicom::ul::pdu::PDataValue {
							presentation_context_id: pdv.presentation_context_id,
							value_type: pdv.value_type.clone(),
							is_last: pdv.is_last && index == last,
							data: chunk.to_vec(),
						}],
					});
				}
			}
			pdus
		}
		pdu => vec![pdu],
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::ul::pdu::{PDataValue, PDataValueType};

	#[test]
	fn large_data_values_are_fragmented() {
		let pdu = Pdu::PData {
			data: vec![PDataValue {
				presentation_context_id: 3,
				value_type: PDataValueType::Data,
				is_last: true,
				data: vec![0; 250],
			}],
		};

		let pdus = fragment_pdata(pdu, 112);
		assert_eq!(pdus.len(), 3);
		let flags: Vec<bool> = pdus
			.iter()
			.map(|pdu| match pdu {
				Pdu::PData { data } => data[0].is_last,
				_ => unreachable!(),
			})
			.collect();
		assert_eq!(flags, vec![false, false, true]);
	}

	#[test]
	fn other_pdus_pass_through() {
		assert_eq!(fragment_pdata(Pdu::ReleaseRP, 16).len(), 1);
	}
}
