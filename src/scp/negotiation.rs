//! Presentation context verdicts for an established association.
//!
//! dicom-ul accepts every proposed context whose abstract syntax was advertised for any
//! partition. Which partition and device are on the other end is only known once the
//! association request was verified, so the per-device decision happens here and is
//! enforced when a request arrives on a context.

use super::{NegotiatedContext, PresentationVerdict, ServiceRegistry};
use crate::store::{Device, Partition};
use crate::types::UI;
use tracing::debug;

/// A context accepted by the upper layer during establishment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedContext {
	pub id: u8,
	pub abstract_syntax: UI,
	pub transfer_syntax: UI,
}

pub fn negotiate(
	registry: &ServiceRegistry,
	partition: &Partition,
	device: Option<&Device>,
	accepted: impl IntoIterator<Item = AcceptedContext>,
) -> Vec<NegotiatedContext> {
	accepted
		.into_iter()
		.map(|context| {
			let abstract_syntax = context.abstract_syntax.trim_end_matches('\0');
			let verdict = registry
				.for_abstract_syntax(partition, abstract_syntax)
				.map_or(PresentationVerdict::RejectAbstractSyntax, |provider| {
					provider.verify_presentation_context(partition, device, abstract_syntax)
				});
			debug!(
				id = context.id,
				abstract_syntax,
				transfer_syntax = %context.transfer_syntax,
				?verdict,
				"Judged presentation context"
			);
			NegotiatedContext {
				id: context.id,
				abstract_syntax: UI::from(abstract_syntax),
				transfer_syntax: context.transfer_syntax,
				verdict,
			}
		})
		.collect()
}
