//! Per-study descriptor listing every stored series and instance together with the
//! instance-level attributes used by image level queries and retrieves.

use crate::dimse::get_str;
use crate::store::StudyLocation;
use crate::types::UI;
use dicom::core::header::Header;
use dicom::core::{Tag, VR};
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DescriptorError {
	#[error("Failed to access study descriptor {path}: {source}")]
	Io {
		path: PathBuf,
		source: std::io::Error,
	},
	#[error("Malformed study descriptor: {0}")]
	Format(#[from] serde_json::Error),
	#[error("Instance is missing {0}")]
	MissingAttribute(Tag),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyDescriptor {
	pub study_instance_uid: UI,
	pub series: BTreeMap<UI, SeriesDescriptor>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesDescriptor {
	pub series_instance_uid: UI,
	pub instances: BTreeMap<UI, InstanceDescriptor>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
	pub sop_instance_uid: UI,
	pub sop_class_uid: UI,
	pub transfer_syntax_uid: UI,
	pub file_size: u64,
	/// Attribute values keyed by `GGGGEEEE`. Sequences and bulk data are not recorded.
	pub attributes: BTreeMap<String, DescriptorAttribute>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorAttribute {
	pub vr: String,
	pub value: String,
}

pub fn tag_key(tag: Tag) -> String {
	format!("{:04X}{:04X}", tag.group(), tag.element())
}

fn is_recorded(element: &InMemElement) -> bool {
	!matches!(
		element.vr(),
		VR::SQ | VR::OB | VR::OW | VR::OF | VR::OD | VR::OL | VR::OV | VR::UN
	) && element.tag().group() != 0x0002
		&& element.tag() != tags::PIXEL_DATA
}

impl InstanceDescriptor {
	pub fn from_dataset(
		dataset: &InMemDicomObject,
		transfer_syntax_uid: &str,
		file_size: u64,
	) -> Result<Self, DescriptorError> {
		let sop_instance_uid = get_str(dataset, tags::SOP_INSTANCE_UID)
			.ok_or(DescriptorError::MissingAttribute(tags::SOP_INSTANCE_UID))?;
		let sop_class_uid = get_str(dataset, tags::SOP_CLASS_UID)
			.ok_or(DescriptorError::MissingAttribute(tags::SOP_CLASS_UID))?;

		let attributes = dataset
			.iter()
			.filter(|element| is_recorded(element))
			.filter_map(|element| {
				let value = element.to_str().ok()?;
				Some((
					tag_key(element.tag()),
					DescriptorAttribute {
						vr: element.vr().to_string().to_owned(),
						value: value.trim_end_matches([' ', '\0']).to_owned(),
					},
				))
			})
			.collect();

		Ok(Self {
			sop_instance_uid,
			sop_class_uid,
			transfer_syntax_uid: transfer_syntax_uid.trim_end_matches('\0').to_owned(),
			file_size,
			attributes,
		})
	}

	pub fn attribute(&self, tag: Tag) -> Option<&DescriptorAttribute> {
		self.attributes.get(&tag_key(tag))
	}
}

impl StudyDescriptor {
	pub fn new(study_instance_uid: impl Into<UI>) -> Self {
		Self {
			study_instance_uid: study_instance_uid.into(),
			series: BTreeMap::new(),
		}
	}

	/// Adds or replaces an instance, returning the replaced entry.
	pub fn add_file(
		&mut self,
		series_instance_uid: &str,
		instance: InstanceDescriptor,
	) -> Option<InstanceDescriptor> {
		self.series
			.entry(UI::from(series_instance_uid))
			.or_insert_with(|| SeriesDescriptor {
				series_instance_uid: UI::from(series_instance_uid),
				instances: BTreeMap::new(),
			})
			.instances
			.insert(instance.sop_instance_uid.clone(), instance)
	}

	/// Removes an instance. Series left without instances are removed as well.
	pub fn remove_file(
		&mut self,
		series_instance_uid: &str,
		sop_instance_uid: &str,
	) -> Option<InstanceDescriptor> {
		let series = self.series.get_mut(series_instance_uid)?;
		let removed = series.instances.remove(sop_instance_uid);
		if series.instances.is_empty() {
			self.series.remove(series_instance_uid);
		}
		removed
	}

	pub fn series(&self) -> impl Iterator<Item = &SeriesDescriptor> {
		self.series.values()
	}

	pub fn find_series(&self, series_instance_uid: &str) -> Option<&SeriesDescriptor> {
		self.series.get(series_instance_uid)
	}

	pub fn instance(
		&self,
		series_instance_uid: &str,
		sop_instance_uid: &str,
	) -> Option<&InstanceDescriptor> {
		self.find_series(series_instance_uid)?
			.instances
			.get(sop_instance_uid)
	}

	pub fn instance_count(&self) -> usize {
		self.series.values().map(|series| series.instances.len()).sum()
	}
}

impl SeriesDescriptor {
	pub fn instances(&self) -> impl Iterator<Item = &InstanceDescriptor> {
		self.instances.values()
	}
}

/// Path of an instance file below a study folder.
pub fn instance_path(study_folder: &Path, series_instance_uid: &str, sop_instance_uid: &str) -> PathBuf {
	study_folder
		.join(series_instance_uid)
		.join(format!("{sop_instance_uid}.dcm"))
}

/// Loads and encodes study descriptors. Writes go through
/// [`SaveDescriptorCommand`](crate::command::descriptor::SaveDescriptorCommand).
pub trait DescriptorStore: Send + Sync {
	fn path(&self, location: &StudyLocation) -> PathBuf;

	/// Loads the descriptor of a study. A study without descriptor yields an empty one.
	fn load(&self, location: &StudyLocation) -> Result<StudyDescriptor, DescriptorError>;

	fn encode(&self, descriptor: &StudyDescriptor) -> Result<Vec<u8>, DescriptorError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDescriptorStore;

impl DescriptorStore for JsonDescriptorStore {
	fn path(&self, location: &StudyLocation) -> PathBuf {
		location
			.path
			.join(format!("{}.json", location.study_instance_uid))
	}

	fn load(&self, location: &StudyLocation) -> Result<StudyDescriptor, DescriptorError> {
		let path = self.path(location);
		match std::fs::read(&path) {
			Ok(content) => Ok(serde_json::from_slice(&content)?),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
				Ok(StudyDescriptor::new(location.study_instance_uid.clone()))
			}
			Err(source) => Err(DescriptorError::Io { path, source }),
		}
	}

	fn encode(&self, descriptor: &StudyDescriptor) -> Result<Vec<u8>, DescriptorError> {
		Ok(serde_json::to_vec_pretty(descriptor)?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::core::DataElement;
	use dicom::dicom_value;

	pub fn instance(sop_instance_uid: &str) -> InstanceDescriptor {
		InstanceDescriptor {
			sop_instance_uid: UI::from(sop_instance_uid),
			sop_class_uid: UI::from("1.2.840.10008.5.1.4.1.1.2"),
			transfer_syntax_uid: UI::from("1.2.840.10008.1.2.1"),
			file_size: 0,
			attributes: BTreeMap::new(),
		}
	}

	#[test]
	fn add_and_remove_files() {
		let mut descriptor = StudyDescriptor::new("1.2");
		assert!(descriptor.add_file("1.2.1", instance("1.2.1.1")).is_none());
		assert!(descriptor.add_file("1.2.1", instance("1.2.1.2")).is_none());
		assert!(descriptor.add_file("1.2.1", instance("1.2.1.2")).is_some());
		assert_eq!(descriptor.instance_count(), 2);

		descriptor.remove_file("1.2.1", "1.2.1.1");
		descriptor.remove_file("1.2.1", "1.2.1.2");
		assert!(descriptor.find_series("1.2.1").is_none());
	}

	#[test]
	fn descriptor_from_dataset_skips_bulk_data() {
		let dataset = InMemDicomObject::from_element_iter([
			DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, "1.2.3")),
			DataElement::new(tags::SOP_CLASS_UID, VR::UI, dicom_value!(Str, "1.2.840.10008.5.1.4.1.1.2")),
			DataElement::new(tags::INSTANCE_NUMBER, VR::IS, dicom_value!(Str, "7")),
			DataElement::new(tags::PIXEL_DATA, VR::OW, dicom_value!(U16, [1, 2, 3])),
		]);
		let instance = InstanceDescriptor::from_dataset(&dataset, "1.2.840.10008.1.2", 10)
			.expect("valid instance");
		assert_eq!(
			instance.attribute(tags::INSTANCE_NUMBER).map(|a| a.value.as_str()),
			Some("7")
		);
		assert!(instance.attribute(tags::PIXEL_DATA).is_none());
	}

	#[test]
	fn missing_descriptor_loads_empty() {
		let dir = tempfile::tempdir().unwrap();
		let location = StudyLocation {
			study_instance_uid: UI::from("9.9"),
			path: dir.path().join("9.9"),
		};
		let descriptor = JsonDescriptorStore.load(&location).unwrap();
		assert_eq!(descriptor.study_instance_uid, "9.9");
		assert_eq!(descriptor.instance_count(), 0);
	}
}
