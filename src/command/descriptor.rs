//! Commands mutating a study descriptor.

use super::file::SaveFileCommand;
use super::{Command, CommandContext, CommandError, ExecutionScope};
use crate::descriptor::{DescriptorStore, InstanceDescriptor, StudyDescriptor};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

pub type SharedDescriptor = Arc<Mutex<StudyDescriptor>>;

fn lock(descriptor: &SharedDescriptor) -> MutexGuard<'_, StudyDescriptor> {
	// A poisoned descriptor is still structurally valid.
	descriptor
		.lock()
		.unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Adds an instance to the in-memory descriptor.
pub struct InsertInstanceCommand {
	description: String,
	descriptor: SharedDescriptor,
	series_instance_uid: String,
	sop_instance_uid: String,
	instance: Option<InstanceDescriptor>,
	replaced: Option<Option<InstanceDescriptor>>,
}

impl InsertInstanceCommand {
	pub fn new(
		descriptor: SharedDescriptor,
		series_instance_uid: impl Into<String>,
		instance: InstanceDescriptor,
	) -> Self {
		Self {
			description: format!("Insert {} into study descriptor", instance.sop_instance_uid),
			descriptor,
			series_instance_uid: series_instance_uid.into(),
			sop_instance_uid: instance.sop_instance_uid.clone(),
			instance: Some(instance),
			replaced: None,
		}
	}
}

impl Command for InsertInstanceCommand {
	fn description(&self) -> &str {
		&self.description
	}

	fn execute(&mut self, _scope: &mut ExecutionScope<'_>) -> Result<(), CommandError> {
		if let Some(instance) = self.instance.take() {
			let previous = lock(&self.descriptor).add_file(&self.series_instance_uid, instance);
			self.replaced = Some(previous);
		}
		Ok(())
	}

	fn undo(&mut self, _context: &CommandContext) -> Result<(), CommandError> {
		let Some(previous) = self.replaced.take() else {
			return Ok(());
		};
		let mut descriptor = lock(&self.descriptor);
		match previous {
			Some(previous) => {
				descriptor.add_file(&self.series_instance_uid, previous);
			}
			None => {
				descriptor.remove_file(&self.series_instance_uid, &self.sop_instance_uid);
			}
		}
		Ok(())
	}
}

/// Writes the descriptor to disk, replacing the previous version.
pub struct SaveDescriptorCommand {
	description: String,
	descriptor: SharedDescriptor,
	store: Arc<dyn DescriptorStore>,
	path: PathBuf,
	save: Option<SaveFileCommand>,
}

impl SaveDescriptorCommand {
	pub fn new(descriptor: SharedDescriptor, store: Arc<dyn DescriptorStore>, path: PathBuf) -> Self {
		Self {
			description: format!("Save study descriptor {}", path.display()),
			descriptor,
			store,
			path,
			save: None,
		}
	}
}

impl Command for SaveDescriptorCommand {
	fn description(&self) -> &str {
		&self.description
	}

	fn execute(&mut self, scope: &mut ExecutionScope<'_>) -> Result<(), CommandError> {
		let content = self.store.encode(&lock(&self.descriptor))?;
		let mut save = SaveFileCommand::new(&self.path, content, false);
		save.execute(scope)?;
		self.save = Some(save);
		Ok(())
	}

	fn undo(&mut self, context: &CommandContext) -> Result<(), CommandError> {
		match self.save.as_mut() {
			Some(save) => save.undo(context),
			None => Ok(()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::command::tests::{context, Journal, Recording};
	use crate::command::CommandProcessor;
	use crate::descriptor::JsonDescriptorStore;
	use crate::store::StudyLocation;
	use std::collections::BTreeMap;

	fn instance(sop_instance_uid: &str) -> InstanceDescriptor {
		InstanceDescriptor {
			sop_instance_uid: sop_instance_uid.to_owned(),
			sop_class_uid: String::from("1.2.840.10008.5.1.4.1.1.2"),
			transfer_syntax_uid: String::from("1.2.840.10008.1.2.1"),
			file_size: 0,
			attributes: BTreeMap::new(),
		}
	}

	#[test]
	fn failed_save_restores_descriptor_and_file() {
		let dir = tempfile::tempdir().unwrap();
		let location = StudyLocation {
			study_instance_uid: String::from("1.2"),
			path: dir.path().to_path_buf(),
		};
		let store: Arc<dyn DescriptorStore> = Arc::new(JsonDescriptorStore);
		let path = store.path(&location);

		let mut initial = StudyDescriptor::new("1.2");
		initial.add_file("1.2.1", instance("1.2.1.1"));
		std::fs::write(&path, store.encode(&initial).unwrap()).unwrap();

		let descriptor = Arc::new(Mutex::new(store.load(&location).unwrap()));
		let log = Journal::default();
		let mut processor = CommandProcessor::new("import", context(dir.path()));
		processor.add(InsertInstanceCommand::new(
			Arc::clone(&descriptor),
			"1.2.1",
			instance("1.2.1.2"),
		));
		processor.add(SaveDescriptorCommand::new(
			Arc::clone(&descriptor),
			Arc::clone(&store),
			path.clone(),
		));
		processor.add(Recording::failing("index", &log));

		assert!(processor.execute().is_err());
		assert_eq!(*descriptor.lock().unwrap(), initial);
		assert_eq!(store.load(&location).unwrap(), initial);
	}

	#[test]
	fn replaced_instance_is_restored() {
		let dir = tempfile::tempdir().unwrap();
		let mut original = instance("1.2.1.1");
		original.file_size = 42;
		let mut descriptor = StudyDescriptor::new("1.2");
		descriptor.add_file("1.2.1", original.clone());
		let descriptor = Arc::new(Mutex::new(descriptor));

		let log = Journal::default();
		let mut processor = CommandProcessor::new("replace", context(dir.path()));
		processor.add(InsertInstanceCommand::new(
			Arc::clone(&descriptor),
			"1.2.1",
			instance("1.2.1.1"),
		));
		processor.add(Recording::failing("later", &log));

		assert!(processor.execute().is_err());
		assert_eq!(
			descriptor.lock().unwrap().instance("1.2.1", "1.2.1.1"),
			Some(&original)
		);
	}
}
