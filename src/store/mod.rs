//! Persistent store collaborators.
//!
//! The service class providers only see the traits in this module. [`JsonStore`] is the
//! bundled implementation backed by a single JSON document.

pub mod criteria;
mod json;

pub use json::JsonStore;

use crate::types::{AE, UI};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use criteria::{PatientCriteria, SeriesCriteria, StudyCriteria};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("Failed to persist store document: {0}")]
	Io(#[from] std::io::Error),
	#[error("Failed to (de)serialize store document: {0}")]
	Serde(#[from] serde_json::Error),
	#[error("{0} not found")]
	NotFound(String),
	#[error("{0} already exists")]
	Conflict(String),
}

pub type RowStream<T> = BoxStream<'static, Result<T, StoreError>>;

/// How duplicates of an already stored SOP instance are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
	#[default]
	RejectDuplicates,
	/// Acknowledge the duplicate without storing it.
	SendSuccess,
	/// Replace the stored instance.
	AcceptLatest,
}

/// A server partition, addressed by its called AE title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct Partition {
	pub ae_title: AE,
	#[serde(default)]
	pub description: String,
	#[serde(default = "enabled")]
	pub enabled: bool,
	#[serde(default)]
	pub accept_any_device: bool,
	#[serde(default)]
	pub auto_insert_device: bool,
	#[serde(default)]
	pub duplicate_policy: DuplicatePolicy,
	/// Filesystem root of the partition's study folders.
	pub root: PathBuf,
	/// Only propose implicit VR little endian when forwarding.
	#[serde(default)]
	pub implicit_only: bool,
	/// Senders whose instances always replace stored duplicates.
	#[serde(default)]
	pub primary_sources: Vec<AE>,
	/// Storage SOP classes accepted by the partition. Empty accepts every known class.
	#[serde(default)]
	pub sop_classes: Vec<UI>,
}

const fn enabled() -> bool {
	true
}

impl Partition {
	pub fn is_primary_source(&self, ae_title: &str) -> bool {
		self.primary_sources.iter().any(|source| source == ae_title)
	}
}

/// A remote application entity known to a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct Device {
	pub key: Uuid,
	pub partition: AE,
	pub ae_title: AE,
	#[serde(default)]
	pub description: String,
	pub ip_address: Option<IpAddr>,
	pub port: u16,
	#[serde(default)]
	pub dhcp: bool,
	pub enabled: bool,
	pub allow_storage: bool,
	pub allow_query: bool,
	pub allow_retrieve: bool,
	/// Accept key object selection and presentation state objects regardless of the
	/// partition's SOP class list.
	#[serde(default)]
	pub accept_kopr: bool,
	/// Upper bound for concurrent outbound associations to this device.
	#[serde(default)]
	pub max_outbound_associations: Option<usize>,
	/// Storage SOP classes this device may send. `None` defers to the partition.
	#[serde(default)]
	pub sop_classes: Option<Vec<UI>>,
	#[serde(default)]
	pub last_accessed: Option<DateTime<Utc>>,
}

impl Device {
	/// A device created on first contact from an unknown calling AE title.
	pub fn auto_provisioned(partition: &str, ae_title: &str, address: IpAddr) -> Self {
		Self {
			key: Uuid::new_v4(),
			partition: AE::from(partition),
			ae_title: AE::from(ae_title),
			description: format!("AE: {ae_title}"),
			ip_address: Some(address),
			port: 104,
			dhcp: true,
			enabled: true,
			allow_storage: true,
			allow_query: true,
			allow_retrieve: true,
			accept_kopr: false,
			max_outbound_associations: None,
			sop_classes: None,
			last_accessed: Some(Utc::now()),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StudyStatus {
	#[default]
	Online,
	Nearline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QueueState {
	#[default]
	Idle,
	ProcessingScheduled,
	DeleteScheduled,
	EditScheduled,
	RestoreScheduled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Patient {
	pub key: Uuid,
	pub partition: AE,
	pub patient_id: String,
	pub patients_name: String,
	pub issuer_of_patient_id: String,
	pub specific_character_set: String,
	pub number_of_related_studies: u32,
	pub number_of_related_series: u32,
	pub number_of_related_instances: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Study {
	pub key: Uuid,
	pub patient_key: Uuid,
	pub partition: AE,
	pub study_instance_uid: UI,
	pub patient_id: String,
	pub patients_name: String,
	pub patients_birth_date: String,
	pub patients_sex: String,
	pub patients_age: String,
	pub study_date: String,
	pub study_time: String,
	pub accession_number: String,
	pub study_id: String,
	pub study_description: String,
	pub referring_physicians_name: String,
	pub specific_character_set: String,
	pub number_of_related_series: u32,
	pub number_of_related_instances: u32,
	pub status: StudyStatus,
	pub queue_state: QueueState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestAttributes {
	pub scheduled_procedure_step_id: String,
	pub requested_procedure_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Series {
	pub key: Uuid,
	pub study_key: Uuid,
	pub partition: AE,
	pub series_instance_uid: UI,
	pub modality: String,
	pub series_number: String,
	pub series_description: String,
	pub performed_procedure_step_start_date: String,
	pub performed_procedure_step_start_time: String,
	pub number_of_related_instances: u32,
	pub source_ae_title: AE,
	pub request_attributes: Vec<RequestAttributes>,
}

/// Transfer syntax a device prefers for a SOP class when we send to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferredSyntax {
	pub device_key: Uuid,
	pub sop_class_uid: UI,
	pub transfer_syntax_uid: UI,
}

/// Index data of one received instance, extracted by the importer.
#[derive(Debug, Clone, Default)]
pub struct IndexEntry {
	pub patient: Patient,
	pub study: Study,
	pub series: Series,
	pub sop_instance_uid: UI,
}

/// Where a study's files can be read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyLocation {
	pub study_instance_uid: UI,
	pub path: PathBuf,
}

#[derive(Debug, Error)]
pub enum LocateError {
	#[error("Study {0} is not stored in this partition")]
	NotFound(UI),
	#[error("Study {study_instance_uid} is nearline (restore requested: {restore_requested})")]
	Nearline {
		study_instance_uid: UI,
		restore_requested: bool,
	},
	#[error(transparent)]
	Store(#[from] StoreError),
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
	async fn find_device(&self, partition: &str, ae_title: &str)
		-> Result<Option<Device>, StoreError>;

	async fn insert_device(&self, device: Device) -> Result<(), StoreError>;

	async fn update_device(&self, device: &Device) -> Result<(), StoreError>;
}

#[async_trait]
pub trait PartitionStore: Send + Sync {
	async fn find_partition(&self, ae_title: &str) -> Result<Option<Partition>, StoreError>;

	async fn partitions(&self) -> Result<Vec<Partition>, StoreError>;
}

#[async_trait]
pub trait StudyIndex: Send + Sync {
	async fn find_patients(
		&self,
		partition: &str,
		criteria: PatientCriteria,
	) -> Result<RowStream<Patient>, StoreError>;

	async fn find_studies(
		&self,
		partition: &str,
		criteria: StudyCriteria,
	) -> Result<RowStream<Study>, StoreError>;

	async fn find_series(
		&self,
		partition: &str,
		criteria: SeriesCriteria,
	) -> Result<RowStream<Series>, StoreError>;

	async fn find_study(&self, partition: &str, study_instance_uid: &str)
		-> Result<Option<Study>, StoreError>;

	/// Distinct modalities of a study's series.
	async fn modalities_in_study(&self, study_key: Uuid) -> Result<Vec<String>, StoreError>;

	/// Adds or refreshes the patient, study and series rows of a received instance.
	async fn record_instance(&self, partition: &str, entry: IndexEntry) -> Result<(), StoreError>;
}

#[async_trait]
pub trait PreferredSyntaxStore: Send + Sync {
	async fn preferred_syntaxes(&self, device_key: Uuid) -> Result<Vec<PreferredSyntax>, StoreError>;
}

#[async_trait]
pub trait StudyLocator: Send + Sync {
	/// Resolves a readable location. Nearline studies get a restore request queued.
	async fn readable_location(
		&self,
		partition: &Partition,
		study_instance_uid: &str,
	) -> Result<StudyLocation, LocateError>;

	/// Resolves the location new instances of a study are written to.
	async fn writable_location(
		&self,
		partition: &Partition,
		study_instance_uid: &str,
	) -> Result<StudyLocation, LocateError>;
}
