//! Audit trail of the DICOM services, written as `tracing` events with the `audit` target
//! so a subscriber can route them to a dedicated sink.

use crate::device::{RejectReason, RejectResult};
use crate::forward::Progress;
use crate::import::ProcessingResult;
use crate::scp::query::QueryOutcome;
use crate::scp::AssociationContext;
use crate::types::{QueryRetrieveLevel, US};
use std::net::SocketAddr;
use tracing::{info, warn};

pub fn association_established(context: &AssociationContext) {
	info!(
		target: "audit",
		association = %context.id,
		calling_ae = %context.calling_ae,
		called_ae = %context.called_ae,
		remote = %context.remote,
		contexts = context.presentation_contexts.len(),
		"Association established"
	);
}

pub fn association_rejected(remote: SocketAddr, result: RejectResult, reason: RejectReason) {
	warn!(
		target: "audit",
		%remote,
		?result,
		?reason,
		"Association rejected"
	);
}

pub fn instance_received(context: &AssociationContext, sop_instance_uid: &str, result: &ProcessingResult) {
	info!(
		target: "audit",
		association = %context.id,
		calling_ae = %context.calling_ae,
		partition = %context.partition.ae_title,
		sop_instance_uid,
		study_instance_uid = result.study_instance_uid.as_deref().unwrap_or_default(),
		successful = result.successful,
		status = result.status,
		"Instance received"
	);
}

pub fn query(context: &AssociationContext, level: QueryRetrieveLevel, outcome: QueryOutcome, matches: usize) {
	info!(
		target: "audit",
		association = %context.id,
		calling_ae = %context.calling_ae,
		partition = %context.partition.ae_title,
		%level,
		?outcome,
		matches,
		"Query"
	);
}

pub fn query_failed(context: &AssociationContext, level: Option<QueryRetrieveLevel>, status: US, comment: &str) {
	warn!(
		target: "audit",
		association = %context.id,
		calling_ae = %context.calling_ae,
		partition = %context.partition.ae_title,
		level = level.map(|level| level.to_string()),
		status,
		comment,
		"Query failed"
	);
}

pub fn retrieve(context: &AssociationContext, destination: &str, status: US, progress: Progress) {
	info!(
		target: "audit",
		association = %context.id,
		calling_ae = %context.calling_ae,
		partition = %context.partition.ae_title,
		destination,
		status,
		completed = progress.completed,
		failed = progress.failed,
		warning = progress.warning,
		"Instances transferred"
	);
}
