use super::{
	fragment_pdata, oneshot, AskPattern, Association, AssociationError, ChannelError, Command,
	Sender,
};
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::association::server::AccessControl;
use dicom::ul::pdu::Pdu;
use dicom::ul::pdu::PresentationContextNegotiated;
use std::convert::identity;
use std::io::{ErrorKind, Write};
use std::{net::TcpStream, thread, time::Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Server side of an association.
///
/// The blocking dicom-ul association lives on a reader thread. Outgoing PDUs are written
/// by a second thread on a clone of the TCP stream, so responses can be sent while
/// the reader waits for the next request (e.g. a C-CANCEL-RQ).
#[derive(Debug)]
pub struct ServerAssociation {
	reader: Sender<Command>,
	writer: Sender<Command>,
	presentation_contexts: Vec<PresentationContextNegotiated>,
	calling_aet: String,
	tcp_stream: TcpStream,
	id: Uuid,
}

pub struct ServerAssociationOptions<A> {
	pub aet: String,
	pub tcp_stream: TcpStream,
	pub uncompressed: bool,
	/// Abstract syntaxes advertised by the registered service class providers.
	pub abstract_syntaxes: Vec<String>,
	pub access_control: A,
	pub max_pdu_length: u32,
	pub id: Uuid,
}

impl ServerAssociation {
	pub async fn new<A>(options: ServerAssociationOptions<A>) -> Result<Self, AssociationError>
	where
		A: AccessControl + Send + 'static,
	{
		let id = options.id;
		let mut server_options = dicom::ul::ServerAssociationOptions::new()
			.ae_title(options.aet.clone())
			.ae_access_control(options.access_control);

		for abstract_syntax in options.abstract_syntaxes {
			server_options = server_options.with_abstract_syntax(abstract_syntax);
		}

		for syntax in TransferSyntaxRegistry.iter() {
			if (options.uncompressed && syntax.is_codec_free())
				|| (!options.uncompressed && !syntax.is_unsupported())
			{
				server_options = server_options.with_transfer_syntax(syntax.uid());
			}
		}

		let (connect_tx, connect_result) = oneshot::channel::<Result<_, AssociationError>>();

		let (tx, mut rx) = tokio::sync::mpsc::channel::<Command>(1);
		let _handle = thread::Builder::new()
			.name(format!("{}-server", options.aet))
			.spawn(move || {
				let span = tracing::info_span!("ServerAssociation", association_id = %id);
				let _enter = span.enter();

				let mut association = match server_options.establish(options.tcp_stream) {
					Ok(mut association) => {
						info!(
							calling_aet = association.client_ae_title(),
							called_aet = options.aet,
							"Established new server association"
						);

						let pcs = association.presentation_contexts().to_vec();
						let calling_aet = association.client_ae_title().to_owned();

						match association.inner_stream().try_clone() {
							Ok(stream) => {
								connect_tx
									.send(Ok((stream, pcs, calling_aet)))
									.map_err(|_value| ())?;
							}
							Err(err) => {
								connect_tx
									.send(Err(AssociationError::OsThread(err)))
									.map_err(|_value| ())?;
								return Err(());
							}
						}
						association
					}
					Err(e) => {
						connect_tx.send(Err(e.into())).map_err(|_value| ())?;
						return Err(());
					}
				};

				while let Some(command) = rx.blocking_recv() {
					let result = match command {
						Command::Receive(response) => {
							let receive_result =
								association.receive().map_err(AssociationError::Association);
							response
								.send(receive_result)
								.map_err(|_value| ChannelError::Closed)
						}
						Command::Send(_, response) | Command::Release(response) => response
							.send(Err(AssociationError::Channel(ChannelError::Closed)))
							.map_err(|_value| ChannelError::Closed),
					};

					if let Some(err) = result.err() {
						error!("Error in ServerAssociation: {err}");
						return Err(());
					}
				}

				rx.close();

				if let Err(e) = association.abort() {
					match e {
						dicom::ul::association::Error::WireSend { source, .. }
							if source.kind() == ErrorKind::BrokenPipe =>
						{
							// no-op, happens on MacOS if the TCP stream is already closed
						}
						_ => {
							debug!("ServerAssociation.abort() returned error: {e}");
						}
					}
				}

				Ok(())
			})
			.map_err(AssociationError::OsThread)?;

		let (tcp_stream, presentation_contexts, calling_aet) = connect_result
			.await
			.map_err(|_| AssociationError::Channel(ChannelError::Closed))??;

		let writer = Self::spawn_writer(&tcp_stream, id, options.max_pdu_length)?;

		Ok(Self {
			reader: tx,
			writer,
			presentation_contexts,
			calling_aet,
			tcp_stream,
			id,
		})
	}

	fn spawn_writer(
		tcp_stream: &TcpStream,
		id: Uuid,
		max_pdu_length: u32,
	) -> Result<Sender<Command>, AssociationError> {
		let mut stream = tcp_stream.try_clone().map_err(AssociationError::OsThread)?;
		let (tx, mut rx) = tokio::sync::mpsc::channel::<Command>(8);
		thread::Builder::new()
			.name(format!("{id}-writer"))
			.spawn(move || {
				while let Some(command) = rx.blocking_recv() {
					let delivered = match command {
						Command::Send(pdu, response) => {
							let send_result = fragment_pdata(pdu, max_pdu_length)
								.iter()
								.try_for_each(|pdu| {
									dicom::ul::pdu::write_pdu(&mut stream, pdu)
										.map_err(|err| AssociationError::Wire(err.to_string()))
								})
								.and_then(|()| stream.flush().map_err(AssociationError::ChunkWriter));
							response.send(send_result).is_ok()
						}
						Command::Receive(response) => response
							.send(Err(AssociationError::Channel(ChannelError::Closed)))
							.is_ok(),
						Command::Release(response) => response
							.send(Err(AssociationError::Channel(ChannelError::Closed)))
							.is_ok(),
					};
					if !delivered {
						debug!(association_id = %id, "Writer reply channel closed");
					}
				}
			})
			.map_err(AssociationError::OsThread)?;
		Ok(tx)
	}

	pub fn calling_aet(&self) -> &str {
		&self.calling_aet
	}

	pub const fn id(&self) -> &Uuid {
		&self.id
	}
}

impl Association for ServerAssociation {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		self.reader
			.ask(Command::Receive, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError> {
		self.writer
			.ask(|reply_to| Command::Send(pdu, reply_to), timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	fn close(&mut self) {
		debug!("Closing TcpStream from outside");

		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
			if err.kind() != ErrorKind::NotConnected {
				warn!("TcpStream::shutdown failed: {err}");
			}
		}
	}

	fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
		&self.presentation_contexts
	}
}

impl Drop for ServerAssociation {
	fn drop(&mut self) {
		self.close();
	}
}
