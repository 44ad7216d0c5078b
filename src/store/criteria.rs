//! Query criteria handed to the [`StudyIndex`](super::StudyIndex).
//!
//! Criteria are built from C-FIND identifiers and evaluated by the store. Each
//! condition targets one column of a row; sub-selects express existence of related rows.

use super::{Patient, QueueState, RequestAttributes, Series, Study, StudyStatus};
use regex::Regex;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum Condition {
	Equals(String),
	/// DICOM wildcard matching (`*` and `?`), compiled to an anchored regex.
	Wildcard(Regex),
	/// Inclusive range, either bound may be open. Used for dates and times.
	Range {
		from: Option<String>,
		to: Option<String>,
	},
	/// List of UID matching.
	In(Vec<String>),
}

impl Condition {
	/// Single value matching. Returns `None` for universal matching (empty value or `*`).
	pub fn from_value(value: &str) -> Option<Self> {
		let value = value.trim_matches(|c: char| c == ' ' || c == '\0');
		if value.is_empty() || value.chars().all(|c| c == '*') {
			return None;
		}
		if value.contains(['*', '?']) {
			wildcard_regex(value).ok().map(Self::Wildcard)
		} else {
			Some(Self::Equals(value.to_owned()))
		}
	}

	/// List of UID matching. A single value falls back to single value matching.
	pub fn from_values(mut values: Vec<String>) -> Option<Self> {
		match values.len() {
			0 => None,
			1 => values.pop().and_then(|value| Self::from_value(&value)),
			_ => Some(Self::In(values)),
		}
	}

	/// Range matching for DA, TM and DT values (`from-to`, `from-`, `-to`).
	pub fn from_range(value: &str) -> Option<Self> {
		let value = value.trim_matches(|c: char| c == ' ' || c == '\0');
		if value.is_empty() {
			return None;
		}
		match value.split_once('-') {
			None => Some(Self::Equals(value.to_owned())),
			Some((from, to)) => {
				let bound = |bound: &str| {
					let bound = bound.trim();
					(!bound.is_empty()).then(|| bound.to_owned())
				};
				let (from, to) = (bound(from), bound(to));
				if from.is_none() && to.is_none() {
					None
				} else {
					Some(Self::Range { from, to })
				}
			}
		}
	}

	pub fn matches(&self, value: &str) -> bool {
		let value = value.trim_matches(|c: char| c == ' ' || c == '\0');
		match self {
			Self::Equals(expected) => value == expected,
			Self::Wildcard(regex) => regex.is_match(value),
			Self::Range { from, to } => {
				if value.is_empty() {
					return false;
				}
				// DA and TM values compare lexicographically once fractions are cut to
				// the precision of the bound.
				let within_from = from.as_deref().is_none_or(|from| {
					truncate(value, from.len()) >= from
				});
				let within_to = to
					.as_deref()
					.is_none_or(|to| truncate(value, to.len()) <= to);
				within_from && within_to
			}
			Self::In(values) => values.iter().any(|expected| expected == value),
		}
	}
}

fn truncate(value: &str, len: usize) -> &str {
	value.get(..len).unwrap_or(value)
}

/// Translates a DICOM wildcard pattern into an anchored regular expression.
pub fn wildcard_regex(pattern: &str) -> Result<Regex, regex::Error> {
	let mut expression = String::with_capacity(pattern.len() + 8);
	expression.push('^');
	for c in pattern.chars() {
		match c {
			'*' => expression.push_str(".*"),
			'?' => expression.push('.'),
			c => expression.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
		}
	}
	expression.push('$');
	Regex::new(&expression)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatientField {
	PatientId,
	PatientsName,
	IssuerOfPatientId,
}

impl PatientField {
	pub fn value(self, patient: &Patient) -> &str {
		match self {
			Self::PatientId => &patient.patient_id,
			Self::PatientsName => &patient.patients_name,
			Self::IssuerOfPatientId => &patient.issuer_of_patient_id,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudyField {
	StudyInstanceUid,
	PatientId,
	PatientsName,
	PatientsBirthDate,
	PatientsSex,
	StudyDate,
	StudyTime,
	AccessionNumber,
	StudyId,
	StudyDescription,
	ReferringPhysiciansName,
}

impl StudyField {
	pub fn value(self, study: &Study) -> &str {
		match self {
			Self::StudyInstanceUid => &study.study_instance_uid,
			Self::PatientId => &study.patient_id,
			Self::PatientsName => &study.patients_name,
			Self::PatientsBirthDate => &study.patients_birth_date,
			Self::PatientsSex => &study.patients_sex,
			Self::StudyDate => &study.study_date,
			Self::StudyTime => &study.study_time,
			Self::AccessionNumber => &study.accession_number,
			Self::StudyId => &study.study_id,
			Self::StudyDescription => &study.study_description,
			Self::ReferringPhysiciansName => &study.referring_physicians_name,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesField {
	SeriesInstanceUid,
	Modality,
	SeriesNumber,
	SeriesDescription,
	PerformedProcedureStepStartDate,
	PerformedProcedureStepStartTime,
}

impl SeriesField {
	pub fn value(self, series: &Series) -> &str {
		match self {
			Self::SeriesInstanceUid => &series.series_instance_uid,
			Self::Modality => &series.modality,
			Self::SeriesNumber => &series.series_number,
			Self::SeriesDescription => &series.series_description,
			Self::PerformedProcedureStepStartDate => &series.performed_procedure_step_start_date,
			Self::PerformedProcedureStepStartTime => &series.performed_procedure_step_start_time,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestField {
	ScheduledProcedureStepId,
	RequestedProcedureId,
}

impl RequestField {
	pub fn value(self, attributes: &RequestAttributes) -> &str {
		match self {
			Self::ScheduledProcedureStepId => &attributes.scheduled_procedure_step_id,
			Self::RequestedProcedureId => &attributes.requested_procedure_id,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PatientCriteria {
	pub conditions: Vec<(PatientField, Condition)>,
	/// Only patients with at least one matching study.
	pub studies: Option<StudyCriteria>,
}

impl PatientCriteria {
	pub fn matches(&self, patient: &Patient) -> bool {
		self.conditions
			.iter()
			.all(|(field, condition)| condition.matches(field.value(patient)))
	}
}

#[derive(Debug, Clone, Default)]
pub struct StudyCriteria {
	pub conditions: Vec<(StudyField, Condition)>,
	/// Only studies with at least one matching series.
	pub series: Option<SeriesCriteria>,
	pub patient_key: Option<Uuid>,
	pub status: Option<StudyStatus>,
	pub excluded_queue_states: Vec<QueueState>,
}

impl StudyCriteria {
	pub fn matches(&self, study: &Study) -> bool {
		self.patient_key.is_none_or(|key| study.patient_key == key)
			&& self.status.is_none_or(|status| study.status == status)
			&& !self.excluded_queue_states.contains(&study.queue_state)
			&& self
				.conditions
				.iter()
				.all(|(field, condition)| condition.matches(field.value(study)))
	}
}

#[derive(Debug, Clone, Default)]
pub struct SeriesCriteria {
	pub study_keys: Option<Vec<Uuid>>,
	pub conditions: Vec<(SeriesField, Condition)>,
	/// Matched against any item of the Request Attributes Sequence.
	pub request_attributes: Vec<(RequestField, Condition)>,
}

impl SeriesCriteria {
	pub fn matches(&self, series: &Series) -> bool {
		let request_matches = self.request_attributes.is_empty()
			|| series.request_attributes.iter().any(|attributes| {
				self.request_attributes
					.iter()
					.all(|(field, condition)| condition.matches(field.value(attributes)))
			});

		self.study_keys
			.as_ref()
			.is_none_or(|keys| keys.contains(&series.study_key))
			&& request_matches
			&& self
				.conditions
				.iter()
				.all(|(field, condition)| condition.matches(field.value(series)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn universal_matching_yields_no_condition() {
		assert!(Condition::from_value("").is_none());
		assert!(Condition::from_value("*").is_none());
		assert!(Condition::from_value("  ").is_none());
	}

	#[test]
	fn wildcards() {
		let condition = Condition::from_value("DOE^J*").expect("condition");
		assert!(condition.matches("DOE^JOHN"));
		assert!(condition.matches("DOE^J"));
		assert!(!condition.matches("ROE^JOHN"));

		let condition = Condition::from_value("C?").expect("condition");
		assert!(condition.matches("CT"));
		assert!(!condition.matches("CTX"));

		let condition = Condition::from_value("1.2.*").expect("condition");
		assert!(condition.matches("1.2.840"));
		assert!(!condition.matches("1x2.840"));
	}

	#[test]
	fn date_ranges() {
		let condition = Condition::from_range("20200101-20201231").expect("condition");
		assert!(condition.matches("20200615"));
		assert!(!condition.matches("20210101"));

		let open_end = Condition::from_range("20200101-").expect("condition");
		assert!(open_end.matches("20990101"));
		assert!(!open_end.matches(""));

		let time = Condition::from_range("-1200").expect("condition");
		assert!(time.matches("115959.123"));
		assert!(!time.matches("120100"));

		assert!(matches!(
			Condition::from_range("20200101"),
			Some(Condition::Equals(_))
		));
	}

	#[test]
	fn uid_lists() {
		let condition =
			Condition::from_values(vec![String::from("1.1"), String::from("1.2")]).expect("list");
		assert!(condition.matches("1.2"));
		assert!(!condition.matches("1.3"));
		assert!(matches!(
			Condition::from_values(vec![String::from("1.1")]),
			Some(Condition::Equals(_))
		));
	}
}
