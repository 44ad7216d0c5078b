use super::criteria::{PatientCriteria, SeriesCriteria, StudyCriteria};
use super::{
	Device, DeviceStore, IndexEntry, LocateError, Partition, PartitionStore, Patient,
	PreferredSyntax, PreferredSyntaxStore, QueueState, RowStream, Series, StoreError, Study,
	StudyIndex, StudyLocation, StudyLocator, StudyStatus,
};
use crate::types::UI;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Document {
	partitions: Vec<Partition>,
	devices: Vec<Device>,
	patients: Vec<Patient>,
	studies: Vec<Study>,
	series: Vec<Series>,
	instances: HashMap<Uuid, BTreeSet<UI>>,
	preferred_syntaxes: Vec<PreferredSyntax>,
}

/// Store backed by one JSON document. Every committed write rewrites the document
/// atomically (temp file + rename); reads are served from memory.
pub struct JsonStore {
	path: Option<PathBuf>,
	document: Mutex<Document>,
	device_lookups: AtomicUsize,
}

impl JsonStore {
	/// Opens the document at `path` (or starts empty) and merges the configured partitions.
	pub async fn open(path: Option<PathBuf>, partitions: Vec<Partition>) -> Result<Self, StoreError> {
		let mut document = match &path {
			Some(path) if tokio::fs::try_exists(path).await? => {
				let content = tokio::fs::read(path).await?;
				serde_json::from_slice(&content)?
			}
			_ => Document::default(),
		};

		for partition in partitions {
			match document
				.partitions
				.iter_mut()
				.find(|existing| existing.ae_title == partition.ae_title)
			{
				Some(existing) => *existing = partition,
				None => document.partitions.push(partition),
			}
		}

		let store = Self {
			path,
			document: Mutex::new(document),
			device_lookups: AtomicUsize::new(0),
		};
		{
			let document = store.document.lock().await;
			store.commit(&document).await?;
			info!(
				partitions = document.partitions.len(),
				devices = document.devices.len(),
				studies = document.studies.len(),
				"Opened store"
			);
		}
		Ok(store)
	}

	#[cfg(test)]
	pub fn in_memory(partitions: Vec<Partition>) -> Self {
		Self {
			path: None,
			document: Mutex::new(Document {
				partitions,
				..Document::default()
			}),
			device_lookups: AtomicUsize::new(0),
		}
	}

	/// Number of device queries answered so far.
	#[cfg(test)]
	pub fn device_lookups(&self) -> usize {
		self.device_lookups.load(Ordering::Relaxed)
	}

	async fn commit(&self, document: &Document) -> Result<(), StoreError> {
		let Some(path) = &self.path else {
			return Ok(());
		};
		if let Some(parent) = path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		let content = serde_json::to_vec_pretty(document)?;
		let temp = temp_path(path);
		tokio::fs::write(&temp, content).await?;
		tokio::fs::rename(&temp, path).await?;
		debug!(path = %path.display(), "Committed store document");
		Ok(())
	}

	#[cfg(test)]
	pub async fn set_study_status(
		&self,
		partition: &str,
		study_instance_uid: &str,
		status: StudyStatus,
	) -> Result<(), StoreError> {
		let mut document = self.document.lock().await;
		let study = document
			.studies
			.iter_mut()
			.find(|study| study.partition == partition && study.study_instance_uid == study_instance_uid)
			.ok_or_else(|| StoreError::NotFound(format!("Study {study_instance_uid}")))?;
		study.status = status;
		self.commit(&document).await
	}

	#[cfg(test)]
	pub async fn add_preferred_syntax(&self, syntax: PreferredSyntax) -> Result<(), StoreError> {
		let mut document = self.document.lock().await;
		document.preferred_syntaxes.push(syntax);
		self.commit(&document).await
	}
}

fn temp_path(path: &Path) -> PathBuf {
	let mut name = path.file_name().unwrap_or_default().to_os_string();
	name.push("_tmp");
	path.with_file_name(name)
}

fn rows<T: Send + 'static>(rows: Vec<T>) -> RowStream<T> {
	futures::stream::iter(rows.into_iter().map(Ok)).boxed()
}

fn study_matches(document: &Document, criteria: &StudyCriteria, study: &Study) -> bool {
	criteria.matches(study)
		&& criteria.series.as_ref().is_none_or(|series_criteria| {
			document
				.series
				.iter()
				.any(|series| series.study_key == study.key && series_criteria.matches(series))
		})
}

#[async_trait]
impl DeviceStore for JsonStore {
	async fn find_device(&self, partition: &str, ae_title: &str) -> Result<Option<Device>, StoreError> {
		self.device_lookups.fetch_add(1, Ordering::Relaxed);
		let document = self.document.lock().await;
		Ok(document
			.devices
			.iter()
			.find(|device| device.partition == partition && device.ae_title == ae_title)
			.cloned())
	}

	async fn insert_device(&self, device: Device) -> Result<(), StoreError> {
		let mut document = self.document.lock().await;
		if document
			.devices
			.iter()
			.any(|existing| existing.partition == device.partition && existing.ae_title == device.ae_title)
		{
			return Err(StoreError::Conflict(format!("Device {}", device.ae_title)));
		}
		document.devices.push(device);
		self.commit(&document).await
	}

	async fn update_device(&self, device: &Device) -> Result<(), StoreError> {
		let mut document = self.document.lock().await;
		let existing = document
			.devices
			.iter_mut()
			.find(|existing| existing.key == device.key)
			.ok_or_else(|| StoreError::NotFound(format!("Device {}", device.ae_title)))?;
		existing.clone_from(device);
		self.commit(&document).await
	}
}

#[async_trait]
impl PartitionStore for JsonStore {
	async fn find_partition(&self, ae_title: &str) -> Result<Option<Partition>, StoreError> {
		let document = self.document.lock().await;
		Ok(document
			.partitions
			.iter()
			.find(|partition| partition.ae_title == ae_title)
			.cloned())
	}

	async fn partitions(&self) -> Result<Vec<Partition>, StoreError> {
		Ok(self.document.lock().await.partitions.clone())
	}
}

#[async_trait]
impl StudyIndex for JsonStore {
	async fn find_patients(
		&self,
		partition: &str,
		criteria: PatientCriteria,
	) -> Result<RowStream<Patient>, StoreError> {
		let document = self.document.lock().await;
		let matches = document
			.patients
			.iter()
			.filter(|patient| patient.partition == partition && criteria.matches(patient))
			.filter(|patient| {
				criteria.studies.as_ref().is_none_or(|study_criteria| {
					document.studies.iter().any(|study| {
						study.patient_key == patient.key
							&& study_matches(&document, study_criteria, study)
					})
				})
			})
			.cloned()
			.collect();
		Ok(rows(matches))
	}

	async fn find_studies(
		&self,
		partition: &str,
		criteria: StudyCriteria,
	) -> Result<RowStream<Study>, StoreError> {
		let document = self.document.lock().await;
		let matches = document
			.studies
			.iter()
			.filter(|study| study.partition == partition && study_matches(&document, &criteria, study))
			.cloned()
			.collect();
		Ok(rows(matches))
	}

	async fn find_series(
		&self,
		partition: &str,
		criteria: SeriesCriteria,
	) -> Result<RowStream<Series>, StoreError> {
		let document = self.document.lock().await;
		let matches = document
			.series
			.iter()
			.filter(|series| series.partition == partition && criteria.matches(series))
			.cloned()
			.collect();
		Ok(rows(matches))
	}

	async fn find_study(&self, partition: &str, study_instance_uid: &str) -> Result<Option<Study>, StoreError> {
		let document = self.document.lock().await;
		Ok(document
			.studies
			.iter()
			.find(|study| study.partition == partition && study.study_instance_uid == study_instance_uid)
			.cloned())
	}

	async fn modalities_in_study(&self, study_key: Uuid) -> Result<Vec<String>, StoreError> {
		let document = self.document.lock().await;
		let modalities: BTreeSet<String> = document
			.series
			.iter()
			.filter(|series| series.study_key == study_key && !series.modality.is_empty())
			.map(|series| series.modality.clone())
			.collect();
		Ok(modalities.into_iter().collect())
	}

	async fn record_instance(&self, partition: &str, entry: IndexEntry) -> Result<(), StoreError> {
		let mut document = self.document.lock().await;
		let IndexEntry {
			mut patient,
			mut study,
			mut series,
			sop_instance_uid,
		} = entry;

		let patient_key = match document.patients.iter().position(|existing| {
			existing.partition == partition
				&& existing.patient_id == patient.patient_id
				&& existing.issuer_of_patient_id == patient.issuer_of_patient_id
		}) {
			Some(index) => {
				let existing = &mut document.patients[index];
				existing.patients_name = patient.patients_name;
				existing.key
			}
			None => {
				patient.key = Uuid::new_v4();
				patient.partition = partition.to_owned();
				let key = patient.key;
				document.patients.push(patient);
				key
			}
		};

		let study_key = match document.studies.iter().position(|existing| {
			existing.partition == partition && existing.study_instance_uid == study.study_instance_uid
		}) {
			Some(index) => document.studies[index].key,
			None => {
				study.key = Uuid::new_v4();
				study.patient_key = patient_key;
				study.partition = partition.to_owned();
				let key = study.key;
				document.studies.push(study);
				key
			}
		};

		let series_key = match document.series.iter().position(|existing| {
			existing.study_key == study_key && existing.series_instance_uid == series.series_instance_uid
		}) {
			Some(index) => document.series[index].key,
			None => {
				series.key = Uuid::new_v4();
				series.study_key = study_key;
				series.partition = partition.to_owned();
				let key = series.key;
				document.series.push(series);
				key
			}
		};

		document
			.instances
			.entry(series_key)
			.or_default()
			.insert(sop_instance_uid);

		refresh_counts(&mut document, patient_key);
		self.commit(&document).await
	}
}

/// Recomputes the related-object counters of a patient and its studies and series.
fn refresh_counts(document: &mut Document, patient_key: Uuid) {
	let study_keys: Vec<Uuid> = document
		.studies
		.iter()
		.filter(|study| study.patient_key == patient_key)
		.map(|study| study.key)
		.collect();

	let mut patient_series = 0;
	let mut patient_instances = 0;
	for study_key in &study_keys {
		let mut study_series = 0;
		let mut study_instances = 0;
		for series in document.series.iter_mut().filter(|series| series.study_key == *study_key) {
			let count = document
				.instances
				.get(&series.key)
				.map_or(0, |instances| u32::try_from(instances.len()).unwrap_or(u32::MAX));
			series.number_of_related_instances = count;
			study_series += 1;
			study_instances += count;
		}
		if let Some(study) = document.studies.iter_mut().find(|study| study.key == *study_key) {
			study.number_of_related_series = study_series;
			study.number_of_related_instances = study_instances;
		}
		patient_series += study_series;
		patient_instances += study_instances;
	}

	if let Some(patient) = document.patients.iter_mut().find(|patient| patient.key == patient_key) {
		patient.number_of_related_studies = u32::try_from(study_keys.len()).unwrap_or(u32::MAX);
		patient.number_of_related_series = patient_series;
		patient.number_of_related_instances = patient_instances;
	}
}

#[async_trait]
impl PreferredSyntaxStore for JsonStore {
	async fn preferred_syntaxes(&self, device_key: Uuid) -> Result<Vec<PreferredSyntax>, StoreError> {
		let document = self.document.lock().await;
		Ok(document
			.preferred_syntaxes
			.iter()
			.filter(|syntax| syntax.device_key == device_key)
			.cloned()
			.collect())
	}
}

#[async_trait]
impl StudyLocator for JsonStore {
	async fn readable_location(
		&self,
		partition: &Partition,
		study_instance_uid: &str,
	) -> Result<StudyLocation, LocateError> {
		let mut document = self.document.lock().await;
		let study = document
			.studies
			.iter_mut()
			.find(|study| {
				study.partition == partition.ae_title && study.study_instance_uid == study_instance_uid
			})
			.ok_or_else(|| LocateError::NotFound(UI::from(study_instance_uid)))?;

		if study.status == StudyStatus::Nearline {
			if study.queue_state == QueueState::Idle {
				study.queue_state = QueueState::RestoreScheduled;
				info!(study_instance_uid, "Queued restore of nearline study");
				self.commit(&document).await?;
			}
			return Err(LocateError::Nearline {
				study_instance_uid: UI::from(study_instance_uid),
				restore_requested: true,
			});
		}

		Ok(StudyLocation {
			study_instance_uid: UI::from(study_instance_uid),
			path: partition.root.join(study_instance_uid),
		})
	}

	async fn writable_location(
		&self,
		partition: &Partition,
		study_instance_uid: &str,
	) -> Result<StudyLocation, LocateError> {
		let document = self.document.lock().await;
		let nearline = document.studies.iter().any(|study| {
			study.partition == partition.ae_title
				&& study.study_instance_uid == study_instance_uid
				&& study.status == StudyStatus::Nearline
		});
		if nearline {
			return Err(LocateError::Nearline {
				study_instance_uid: UI::from(study_instance_uid),
				restore_requested: false,
			});
		}
		Ok(StudyLocation {
			study_instance_uid: UI::from(study_instance_uid),
			path: partition.root.join(study_instance_uid),
		})
	}
}
