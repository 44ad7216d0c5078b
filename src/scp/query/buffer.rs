use crate::dimse::cfind::CompositeFindResponse;
use crate::dimse::{status, WriteError};
use crate::scp::ResponseWriter;
use crate::types::{UI, US};
use dicom::object::InMemDicomObject;
use std::ops::ControlFlow;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a query ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
	Completed,
	Cancelled,
	/// More rows matched than the configured maximum.
	LimitReached,
}

/// Collects pending C-FIND responses and writes them in batches.
pub struct ResponseBuffer<'a> {
	writer: &'a dyn ResponseWriter,
	cancel: &'a CancellationToken,
	presentation_context_id: Option<u8>,
	message_id: US,
	sop_class_uid: UI,
	threshold: usize,
	max_responses: Option<usize>,
	pending: Vec<InMemDicomObject>,
	emitted: usize,
}

impl<'a> ResponseBuffer<'a> {
	pub fn new(
		writer: &'a dyn ResponseWriter,
		cancel: &'a CancellationToken,
		presentation_context_id: Option<u8>,
		message_id: US,
		sop_class_uid: impl Into<UI>,
		threshold: usize,
		max_responses: Option<usize>,
	) -> Self {
		Self {
			writer,
			cancel,
			presentation_context_id,
			message_id,
			sop_class_uid: sop_class_uid.into(),
			threshold: threshold.max(1),
			max_responses,
			pending: Vec::new(),
			emitted: 0,
		}
	}

	pub fn buffered(&self) -> usize {
		self.pending.len()
	}

	/// Adds a matching row. Breaks when the query has to stop.
	pub async fn push(
		&mut self,
		identifier: InMemDicomObject,
	) -> Result<ControlFlow<QueryOutcome>, WriteError> {
		if self.cancel.is_cancelled() {
			return Ok(ControlFlow::Break(QueryOutcome::Cancelled));
		}
		if self
			.max_responses
			.is_some_and(|max| self.emitted + self.pending.len() >= max)
		{
			if let ControlFlow::Break(outcome) = self.flush().await? {
				return Ok(ControlFlow::Break(outcome));
			}
			warn!(
				max_responses = self.max_responses,
				"Query matched more rows than allowed, returning the first ones"
			);
			return Ok(ControlFlow::Break(QueryOutcome::LimitReached));
		}

		self.pending.push(identifier);
		if self.pending.len() >= self.threshold {
			return self.flush().await;
		}
		Ok(ControlFlow::Continue(()))
	}

	async fn flush(&mut self) -> Result<ControlFlow<QueryOutcome>, WriteError> {
		if self.cancel.is_cancelled() {
			return Ok(ControlFlow::Break(QueryOutcome::Cancelled));
		}
		let count = self.pending.len();
		for identifier in self.pending.drain(..) {
			let response =
				CompositeFindResponse::new(self.message_id, self.sop_class_uid.as_str(), status::PENDING)
					.identifier(identifier);
			self.writer
				.write(response.into(), self.presentation_context_id)
				.await?;
			self.emitted += 1;
		}
		if count > 0 {
			debug!(count, emitted = self.emitted, "Flushed pending responses");
		}
		Ok(ControlFlow::Continue(()))
	}

	/// Writes the final response. Buffered rows are discarded on cancel.
	pub async fn finish(mut self, outcome: QueryOutcome) -> Result<usize, WriteError> {
		let final_status = match outcome {
			QueryOutcome::Cancelled => {
				self.pending.clear();
				status::CANCEL
			}
			QueryOutcome::Completed | QueryOutcome::LimitReached => {
				if let ControlFlow::Break(QueryOutcome::Cancelled) = self.flush().await? {
					self.pending.clear();
					status::CANCEL
				} else {
					status::SUCCESS
				}
			}
		};
		let response =
			CompositeFindResponse::new(self.message_id, self.sop_class_uid.as_str(), final_status);
		self.writer
			.write(response.into(), self.presentation_context_id)
			.await?;
		Ok(self.emitted)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::scp::tests::RecordingWriter;

	async fn run(rows: usize, threshold: usize, max: Option<usize>) -> (Vec<US>, QueryOutcome, usize) {
		let writer = RecordingWriter::default();
		let cancel = CancellationToken::new();
		let mut buffer = ResponseBuffer::new(&writer, &cancel, Some(1), 1, "1.2", threshold, max);
		let mut outcome = QueryOutcome::Completed;
		let mut peak = 0;
		for _ in 0..rows {
			let flow = buffer.push(InMemDicomObject::new_empty()).await.unwrap();
			peak = peak.max(buffer.buffered());
			if let ControlFlow::Break(stop) = flow {
				outcome = stop;
				break;
			}
		}
		buffer.finish(outcome).await.unwrap();
		(writer.statuses(), outcome, peak)
	}

	#[tokio::test]
	async fn response_count_is_bounded_by_max() {
		for (rows, threshold, max) in [(5, 2, Some(2)), (5, 10, Some(3)), (3, 2, Some(5)), (7, 3, None)] {
			let (statuses, _, peak) = run(rows, threshold, max).await;
			let expected = max.map_or(rows, |max| max.min(rows));
			assert_eq!(statuses.len(), expected + 1, "rows={rows} threshold={threshold} max={max:?}");
			assert_eq!(statuses.last(), Some(&status::SUCCESS));
			assert!(statuses[..expected].iter().all(|status| *status == status::PENDING));
			assert!(peak <= threshold);
		}
	}

	#[tokio::test]
	async fn exceeding_max_ends_with_success() {
		let (statuses, outcome, _) = run(5, 25, Some(2)).await;
		assert_eq!(outcome, QueryOutcome::LimitReached);
		assert_eq!(statuses, vec![status::PENDING, status::PENDING, status::SUCCESS]);
	}

	#[tokio::test]
	async fn cancel_stops_before_next_row() {
		let writer = RecordingWriter::default();
		let cancel = CancellationToken::new();
		let mut buffer = ResponseBuffer::new(&writer, &cancel, Some(1), 1, "1.2", 2, None);

		assert!(buffer.push(InMemDicomObject::new_empty()).await.unwrap().is_continue());
		assert!(buffer.push(InMemDicomObject::new_empty()).await.unwrap().is_continue());
		assert!(buffer.push(InMemDicomObject::new_empty()).await.unwrap().is_continue());
		cancel.cancel();
		let flow = buffer.push(InMemDicomObject::new_empty()).await.unwrap();
		assert_eq!(flow, ControlFlow::Break(QueryOutcome::Cancelled));

		assert_eq!(buffer.finish(QueryOutcome::Cancelled).await.unwrap(), 2);
		assert_eq!(writer.statuses(), vec![status::PENDING, status::PENDING, status::CANCEL]);
	}
}
