use dicom::core::PrimitiveValue;
use dicom::dictionary_std::uids;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// UI (Unique Identifier) value representation.
pub type UI = String;

/// UL (Unsigned Long) value representation.
pub type UL = u32;

/// US (Unsigned Short) value representation.
pub type US = u16;

/// AE (Application Entity) value representation.
pub type AE = String;

/// Priority (0000,0700) values for DIMSE operations.
#[derive(Debug, Copy, Clone, Default)]
pub enum Priority {
	Low = 0x0002,
	#[default]
	Medium = 0x0000,
	High = 0x0001,
}

/// The query/retrieve information models served by the query and move handlers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum QueryInformationModel {
	#[default]
	Study,
	Patient,
}

impl QueryInformationModel {
	pub const fn find_sop_class(&self) -> &'static str {
		match self {
			Self::Study => uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
			Self::Patient => uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
		}
	}

	pub const fn move_sop_class(&self) -> &'static str {
		match self {
			Self::Study => uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
			Self::Patient => uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
		}
	}

	/// Resolves the information model from a FIND or MOVE SOP class UID.
	pub fn from_sop_class(uid: &str) -> Option<Self> {
		match uid.trim_end_matches('\0') {
			uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND
			| uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE => Some(Self::Study),
			uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND
			| uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE => Some(Self::Patient),
			_ => None,
		}
	}

	/// Whether the given level may be queried or retrieved under this model.
	/// The study root model has no patient level.
	pub const fn supports(&self, level: QueryRetrieveLevel) -> bool {
		!matches!(
			(self, level),
			(Self::Study, QueryRetrieveLevel::Patient)
		)
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum QueryRetrieveLevel {
	Patient,
	Study,
	Series,
	Image,
}

impl Display for QueryRetrieveLevel {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Patient => write!(f, "PATIENT"),
			Self::Study => write!(f, "STUDY"),
			Self::Series => write!(f, "SERIES"),
			Self::Image => write!(f, "IMAGE"),
		}
	}
}

impl FromStr for QueryRetrieveLevel {
	type Err = String;

	fn from_str(value: &str) -> Result<Self, Self::Err> {
		match value.trim_matches(|c: char| c == ' ' || c == '\0') {
			"PATIENT" => Ok(Self::Patient),
			"STUDY" => Ok(Self::Study),
			"SERIES" => Ok(Self::Series),
			"IMAGE" => Ok(Self::Image),
			other => Err(other.to_owned()),
		}
	}
}

impl From<QueryRetrieveLevel> for PrimitiveValue {
	fn from(level: QueryRetrieveLevel) -> Self {
		Self::Str(level.to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_level_with_padding() {
		assert_eq!(
			QueryRetrieveLevel::from_str("STUDY "),
			Ok(QueryRetrieveLevel::Study)
		);
		assert_eq!(
			QueryRetrieveLevel::from_str("FRAME"),
			Err(String::from("FRAME"))
		);
	}

	#[test]
	fn study_root_has_no_patient_level() {
		assert!(!QueryInformationModel::Study.supports(QueryRetrieveLevel::Patient));
		assert!(QueryInformationModel::Patient.supports(QueryRetrieveLevel::Patient));
		assert!(QueryInformationModel::Study.supports(QueryRetrieveLevel::Image));
	}

	#[test]
	fn model_from_sop_class() {
		assert_eq!(
			QueryInformationModel::from_sop_class(
				uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE
			),
			Some(QueryInformationModel::Patient)
		);
		assert_eq!(QueryInformationModel::from_sop_class("1.2.3"), None);
	}
}
