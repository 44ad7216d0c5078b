//! Response identifiers of the query levels.
//!
//! Every key of the request is answered: keys we know are filled from the matching
//! row, everything else is returned with an empty value.

use crate::descriptor::InstanceDescriptor;
use crate::store::{Patient, RequestAttributes, Series, Study, StudyStatus};
use crate::types::QueryRetrieveLevel;
use dicom::core::header::Header;
use dicom::core::value::DataSetSequence;
use dicom::core::{DataElement, Tag, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

pub const UNICODE: &str = "ISO_IR 192";

pub fn availability(status: StudyStatus) -> &'static str {
	match status {
		StudyStatus::Online => "ONLINE",
		StudyStatus::Nearline => "NEARLINE",
	}
}

/// Builds one response identifier.
pub struct IdentifierBuilder<'a> {
	request: &'a InMemDicomObject,
	response: InMemDicomObject,
}

impl<'a> IdentifierBuilder<'a> {
	pub fn new(request: &'a InMemDicomObject, level: QueryRetrieveLevel) -> Self {
		let response = InMemDicomObject::from_element_iter([DataElement::new(
			tags::QUERY_RETRIEVE_LEVEL,
			VR::CS,
			dicom_value!(Str, level.to_string()),
		)]);
		Self { request, response }
	}

	pub fn put(&mut self, tag: Tag, vr: VR, value: &str) {
		let element = if value.is_empty() {
			DataElement::empty(tag, vr)
		} else {
			DataElement::new(tag, vr, dicom_value!(Str, value.to_owned()))
		};
		self.response.put(element);
	}

	/// Attributes present in every response regardless of the request.
	#[must_use]
	pub fn common(mut self, retrieve_ae: &str, availability: &str, charset: Option<&str>) -> Self {
		self.put(tags::RETRIEVE_AE_TITLE, VR::AE, retrieve_ae);
		self.put(tags::INSTANCE_AVAILABILITY, VR::CS, availability);
		if let Some(charset) = charset.filter(|charset| !charset.is_empty()) {
			self.put(tags::SPECIFIC_CHARACTER_SET, VR::CS, charset);
		}
		self
	}

	#[must_use]
	pub fn request_attributes(mut self, attributes: &[RequestAttributes]) -> Self {
		if self.request.get(tags::REQUEST_ATTRIBUTES_SEQUENCE).is_none() {
			return self;
		}
		let items: Vec<InMemDicomObject> = attributes
			.iter()
			.map(|attributes| {
				InMemDicomObject::from_element_iter([
					DataElement::new(
						tags::SCHEDULED_PROCEDURE_STEP_ID,
						VR::SH,
						dicom_value!(Str, attributes.scheduled_procedure_step_id.clone()),
					),
					DataElement::new(
						tags::REQUESTED_PROCEDURE_ID,
						VR::SH,
						dicom_value!(Str, attributes.requested_procedure_id.clone()),
					),
				])
			})
			.collect();
		self.response.put(DataElement::new(
			tags::REQUEST_ATTRIBUTES_SEQUENCE,
			VR::SQ,
			DataSetSequence::from(items),
		));
		self
	}

	/// Answers the remaining requested keys. Unknown keys are returned empty.
	pub fn fill(mut self, lookup: impl Fn(Tag) -> Option<String>) -> InMemDicomObject {
		let requested: Vec<(Tag, VR)> = self
			.request
			.iter()
			.map(|element| (element.tag(), element.vr()))
			.filter(|(tag, _)| self.response.get(*tag).is_none())
			.filter(|(tag, _)| *tag != tags::SPECIFIC_CHARACTER_SET)
			.collect();

		for (tag, vr) in requested {
			if vr == VR::SQ {
				self.response.put(DataElement::new(
					tag,
					VR::SQ,
					DataSetSequence::from(Vec::<InMemDicomObject>::new()),
				));
				continue;
			}
			let value = lookup(tag).unwrap_or_default();
			self.put(tag, vr, &value);
		}
		self.response
	}
}

pub fn patient_value(patient: &Patient, tag: Tag) -> Option<String> {
	let value = match tag {
		tags::PATIENT_ID => &patient.patient_id,
		tags::PATIENT_NAME => &patient.patients_name,
		tags::ISSUER_OF_PATIENT_ID => &patient.issuer_of_patient_id,
		tags::NUMBER_OF_PATIENT_RELATED_STUDIES => {
			return Some(patient.number_of_related_studies.to_string())
		}
		tags::NUMBER_OF_PATIENT_RELATED_SERIES => {
			return Some(patient.number_of_related_series.to_string())
		}
		tags::NUMBER_OF_PATIENT_RELATED_INSTANCES => {
			return Some(patient.number_of_related_instances.to_string())
		}
		_ => return None,
	};
	Some(value.clone())
}

/// `modalities` is `None` when they were not requested or could not be loaded.
pub fn study_value(study: &Study, modalities: Option<&[String]>, tag: Tag) -> Option<String> {
	let value = match tag {
		tags::STUDY_INSTANCE_UID => &study.study_instance_uid,
		tags::PATIENT_ID => &study.patient_id,
		tags::PATIENT_NAME => &study.patients_name,
		tags::PATIENT_BIRTH_DATE => &study.patients_birth_date,
		tags::PATIENT_SEX => &study.patients_sex,
		tags::PATIENT_AGE => &study.patients_age,
		tags::STUDY_DATE => &study.study_date,
		tags::STUDY_TIME => &study.study_time,
		tags::ACCESSION_NUMBER => &study.accession_number,
		tags::STUDY_ID => &study.study_id,
		tags::STUDY_DESCRIPTION => &study.study_description,
		tags::REFERRING_PHYSICIAN_NAME => &study.referring_physicians_name,
		tags::NUMBER_OF_STUDY_RELATED_SERIES => {
			return Some(study.number_of_related_series.to_string())
		}
		tags::NUMBER_OF_STUDY_RELATED_INSTANCES => {
			return Some(study.number_of_related_instances.to_string())
		}
		tags::MODALITIES_IN_STUDY => return modalities.map(|modalities| modalities.join("\\")),
		_ => return None,
	};
	Some(value.clone())
}

pub fn series_value(study: &Study, series: &Series, tag: Tag) -> Option<String> {
	let value = match tag {
		tags::STUDY_INSTANCE_UID => &study.study_instance_uid,
		tags::SERIES_INSTANCE_UID => &series.series_instance_uid,
		tags::MODALITY => &series.modality,
		tags::SERIES_NUMBER => &series.series_number,
		tags::SERIES_DESCRIPTION => &series.series_description,
		tags::PERFORMED_PROCEDURE_STEP_START_DATE => &series.performed_procedure_step_start_date,
		tags::PERFORMED_PROCEDURE_STEP_START_TIME => &series.performed_procedure_step_start_time,
		tags::NUMBER_OF_SERIES_RELATED_INSTANCES => {
			return Some(series.number_of_related_instances.to_string())
		}
		_ => return None,
	};
	Some(value.clone())
}

pub fn instance_value(
	study_instance_uid: &str,
	series_instance_uid: &str,
	instance: &InstanceDescriptor,
	tag: Tag,
) -> Option<String> {
	match tag {
		tags::STUDY_INSTANCE_UID => Some(study_instance_uid.to_owned()),
		tags::SERIES_INSTANCE_UID => Some(series_instance_uid.to_owned()),
		tags::SOP_INSTANCE_UID => Some(instance.sop_instance_uid.clone()),
		tags::SOP_CLASS_UID => Some(instance.sop_class_uid.clone()),
		tag => instance.attribute(tag).map(|attribute| attribute.value.clone()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dimse::get_str;

	#[test]
	fn unknown_keys_are_returned_empty() {
		let request = InMemDicomObject::from_element_iter([
			DataElement::new(tags::QUERY_RETRIEVE_LEVEL, VR::CS, dicom_value!(Str, "STUDY")),
			DataElement::empty(tags::STUDY_INSTANCE_UID, VR::UI),
			DataElement::empty(tags::MODALITIES_IN_STUDY, VR::CS),
			DataElement::empty(tags::NUMBER_OF_STUDY_RELATED_INSTANCES, VR::IS),
			DataElement::empty(tags::INSTITUTION_NAME, VR::LO),
		]);
		let study = Study {
			study_instance_uid: String::from("1.2.3"),
			number_of_related_instances: 4,
			specific_character_set: String::from("ISO_IR 100"),
			..Study::default()
		};
		let modalities = vec![String::from("CT"), String::from("SR")];

		let response = IdentifierBuilder::new(&request, QueryRetrieveLevel::Study)
			.common("ARCHIVE", availability(study.status), Some(&study.specific_character_set))
			.fill(|tag| study_value(&study, Some(&modalities), tag));

		assert_eq!(get_str(&response, tags::STUDY_INSTANCE_UID).as_deref(), Some("1.2.3"));
		assert_eq!(get_str(&response, tags::MODALITIES_IN_STUDY).as_deref(), Some("CT\\SR"));
		assert_eq!(get_str(&response, tags::NUMBER_OF_STUDY_RELATED_INSTANCES).as_deref(), Some("4"));
		assert_eq!(get_str(&response, tags::RETRIEVE_AE_TITLE).as_deref(), Some("ARCHIVE"));
		assert_eq!(get_str(&response, tags::INSTANCE_AVAILABILITY).as_deref(), Some("ONLINE"));
		assert_eq!(get_str(&response, tags::SPECIFIC_CHARACTER_SET).as_deref(), Some("ISO_IR 100"));
		assert!(response.get(tags::INSTITUTION_NAME).is_some());
		assert_eq!(get_str(&response, tags::INSTITUTION_NAME), None);
	}

	#[test]
	fn request_attributes_are_returned_when_requested() {
		let request = InMemDicomObject::from_element_iter([DataElement::new(
			tags::REQUEST_ATTRIBUTES_SEQUENCE,
			VR::SQ,
			DataSetSequence::from(Vec::<InMemDicomObject>::new()),
		)]);
		let response = IdentifierBuilder::new(&request, QueryRetrieveLevel::Series)
			.request_attributes(&[RequestAttributes {
				scheduled_procedure_step_id: String::from("SPS1"),
				requested_procedure_id: String::from("RP1"),
			}])
			.fill(|_| None);

		let items = response
			.get(tags::REQUEST_ATTRIBUTES_SEQUENCE)
			.and_then(|element| element.items())
			.expect("sequence");
		assert_eq!(items.len(), 1);
		assert_eq!(
			get_str(&items[0], tags::SCHEDULED_PROCEDURE_STEP_ID).as_deref(),
			Some("SPS1")
		);
	}
}
