//! File system commands.
//!
//! New content is written to a temp file next to its destination and moved into place
//! with a rename. Destinations that already exist are backed up first when the
//! context is [`Disposition::Robust`]. Deletes also keep a backup under
//! [`Disposition::Fast`] when they require rollback.

use super::{Command, CommandContext, CommandError, Disposition, ExecutionScope};
use std::ffi::OsString;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Backups older than this are left over from crashed operations and may be reused.
const BACKUP_RECLAIM_AGE: Duration = Duration::from_secs(12 * 60 * 60);

fn file_name(path: &Path) -> OsString {
	path.file_name().map(OsString::from).unwrap_or_default()
}

/// `<name>_tmp`, then `<name>_1tmp`, `<name>_2tmp`, ... in the destination's directory.
pub fn temp_path(destination: &Path) -> PathBuf {
	let name = file_name(destination);
	let mut attempt = 0_u32;
	loop {
		let mut candidate = name.clone();
		if attempt == 0 {
			candidate.push("_tmp");
		} else {
			candidate.push(format!("_{attempt}tmp"));
		}
		let candidate = destination.with_file_name(candidate);
		if !candidate.exists() {
			return candidate;
		}
		attempt += 1;
	}
}

fn is_reclaimable(path: &Path) -> bool {
	fs::metadata(path)
		.and_then(|metadata| metadata.modified())
		.ok()
		.and_then(|modified| SystemTime::now().duration_since(modified).ok())
		.is_some_and(|age| age > BACKUP_RECLAIM_AGE)
}

fn remove_any(path: &Path) -> std::io::Result<()> {
	if path.is_dir() {
		fs::remove_dir_all(path)
	} else {
		fs::remove_file(path)
	}
}

/// `<name>.bak`, then `<name>.(1).bak`, `<name>.(2).bak`, ... in `directory`.
/// Orphaned backups older than twelve hours are removed and their name reused.
pub fn backup_path(directory: &Path, source: &Path) -> PathBuf {
	let name = file_name(source);
	let mut attempt = 0_u32;
	loop {
		let mut candidate = name.clone();
		if attempt == 0 {
			candidate.push(".bak");
		} else {
			candidate.push(format!(".({attempt}).bak"));
		}
		let candidate = directory.join(candidate);
		if !candidate.exists() {
			return candidate;
		}
		if is_reclaimable(&candidate) && remove_any(&candidate).is_ok() {
			debug!(path = %candidate.display(), "Reclaimed orphaned backup");
			return candidate;
		}
		attempt += 1;
	}
}

/// Renames, falling back to copy and delete across file systems.
fn move_file(source: &Path, destination: &Path) -> std::io::Result<()> {
	match fs::rename(source, destination) {
		Err(err) if err.kind() == ErrorKind::CrossesDevices => {
			fs::copy(source, destination)?;
			fs::remove_file(source)
		}
		result => result,
	}
}

/// A backup copy owned by a command. Dropping it deletes the copy.
#[derive(Debug)]
struct Backup {
	path: PathBuf,
}

impl Backup {
	fn copy_of(source: &Path, context: &CommandContext) -> Result<Self, CommandError> {
		let path = backup_path(context.ensure_backup_directory()?, source);
		fs::copy(source, &path).map_err(CommandError::io(format!(
			"Failed to back up {}",
			source.display()
		)))?;
		Ok(Self { path })
	}

	fn move_of(source: &Path, context: &CommandContext) -> Result<Self, CommandError> {
		let path = backup_path(context.ensure_backup_directory()?, source);
		move_file(source, &path).map_err(CommandError::io(format!(
			"Failed to move {} to backup",
			source.display()
		)))?;
		Ok(Self { path })
	}

	/// Moves the backup back to `destination`, consuming it.
	fn restore(self, destination: &Path) -> Result<(), CommandError> {
		if destination.exists() {
			remove_any(destination).map_err(CommandError::io(format!(
				"Failed to remove {}",
				destination.display()
			)))?;
		}
		move_file(&self.path, destination).map_err(CommandError::io(format!(
			"Failed to restore {}",
			destination.display()
		)))
	}
}

impl Drop for Backup {
	fn drop(&mut self) {
		match remove_any(&self.path) {
			Ok(()) => debug!(path = %self.path.display(), "Removed backup"),
			Err(err) if err.kind() == ErrorKind::NotFound => {}
			Err(err) => warn!(path = %self.path.display(), "Failed to remove backup: {err}"),
		}
	}
}

/// Replaces a destination file with a prepared temp file and knows how to revert it.
#[derive(Debug)]
struct Replacement {
	destination: PathBuf,
	backup: Option<Backup>,
	existed: bool,
	done: bool,
}

impl Replacement {
	fn prepare(
		destination: &Path,
		context: &CommandContext,
		fail_if_exists: bool,
	) -> Result<Self, CommandError> {
		let existed = destination.exists();
		if existed && fail_if_exists {
			return Err(CommandError::AlreadyExists(destination.to_path_buf()));
		}
		let backup = if existed && context.disposition() == Disposition::Robust {
			Some(Backup::copy_of(destination, context)?)
		} else {
			None
		};
		Ok(Self {
			destination: destination.to_path_buf(),
			backup,
			existed,
			done: false,
		})
	}

	fn complete(&mut self, temp: &Path) -> Result<(), CommandError> {
		fs::rename(temp, &self.destination).map_err(CommandError::io(format!(
			"Failed to move {} into place",
			self.destination.display()
		)))?;
		self.done = true;
		Ok(())
	}

	fn undo(&mut self) -> Result<(), CommandError> {
		if !std::mem::take(&mut self.done) {
			return Ok(());
		}
		if let Some(backup) = self.backup.take() {
			return backup.restore(&self.destination);
		}
		if self.existed {
			warn!(
				path = %self.destination.display(),
				"No backup available, original content is lost"
			);
		}
		fs::remove_file(&self.destination).map_err(CommandError::io(format!(
			"Failed to remove {}",
			self.destination.display()
		)))
	}
}

/// Runs `write` against a fresh temp file next to `destination` and syncs the result.
fn write_temp(
	destination: &Path,
	write: impl FnOnce(&Path) -> Result<(), CommandError>,
) -> Result<PathBuf, CommandError> {
	let temp = temp_path(destination);
	if let Err(err) = write(&temp) {
		let _ = fs::remove_file(&temp);
		return Err(err);
	}
	if let Ok(file) = fs::File::open(&temp) {
		file.sync_all()
			.map_err(CommandError::io(format!("Failed to sync {}", temp.display())))?;
	}
	Ok(temp)
}

/// Saves content to a file, replacing an existing one unless `fail_if_exists` is set.
pub struct SaveFileCommand {
	description: String,
	destination: PathBuf,
	content: Vec<u8>,
	fail_if_exists: bool,
	replacement: Option<Replacement>,
}

impl SaveFileCommand {
	pub fn new(destination: impl Into<PathBuf>, content: Vec<u8>, fail_if_exists: bool) -> Self {
		let destination = destination.into();
		Self {
			description: format!("Save {}", destination.display()),
			destination,
			content,
			fail_if_exists,
			replacement: None,
		}
	}
}

impl Command for SaveFileCommand {
	fn description(&self) -> &str {
		&self.description
	}

	fn execute(&mut self, scope: &mut ExecutionScope<'_>) -> Result<(), CommandError> {
		let mut replacement = Replacement::prepare(
			&self.destination,
			scope.context(),
			self.fail_if_exists,
		)?;
		let temp = write_temp(&self.destination, |temp| {
			fs::File::create(temp)
				.and_then(|mut file| file.write_all(&self.content))
				.map_err(CommandError::io(format!("Failed to write {}", temp.display())))
		})?;
		replacement.complete(&temp)?;
		self.replacement = Some(replacement);
		Ok(())
	}

	fn undo(&mut self, _context: &CommandContext) -> Result<(), CommandError> {
		self.replacement.as_mut().map_or(Ok(()), Replacement::undo)
	}
}

/// Copies a file to a destination through a temp file.
pub struct CopyFileCommand {
	description: String,
	source: PathBuf,
	destination: PathBuf,
	fail_if_exists: bool,
	replacement: Option<Replacement>,
}

impl CopyFileCommand {
	pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>, fail_if_exists: bool) -> Self {
		let (source, destination) = (source.into(), destination.into());
		Self {
			description: format!("Copy {} to {}", source.display(), destination.display()),
			source,
			destination,
			fail_if_exists,
			replacement: None,
		}
	}
}

impl Command for CopyFileCommand {
	fn description(&self) -> &str {
		&self.description
	}

	fn execute(&mut self, scope: &mut ExecutionScope<'_>) -> Result<(), CommandError> {
		if !self.source.exists() {
			return Err(CommandError::Missing(self.source.clone()));
		}
		let mut replacement = Replacement::prepare(
			&self.destination,
			scope.context(),
			self.fail_if_exists,
		)?;
		let temp = write_temp(&self.destination, |temp| {
			fs::copy(&self.source, temp)
				.map(|_| ())
				.map_err(CommandError::io(format!("Failed to copy {}", self.source.display())))
		})?;
		replacement.complete(&temp)?;
		self.replacement = Some(replacement);
		Ok(())
	}

	fn undo(&mut self, _context: &CommandContext) -> Result<(), CommandError> {
		self.replacement.as_mut().map_or(Ok(()), Replacement::undo)
	}
}

/// Moves a file to a destination. Undo moves it back and restores a replaced destination.
pub struct RenameFileCommand {
	description: String,
	source: PathBuf,
	destination: PathBuf,
	fail_if_exists: bool,
	backup: Option<Backup>,
	done: bool,
}

impl RenameFileCommand {
	pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>, fail_if_exists: bool) -> Self {
		let (source, destination) = (source.into(), destination.into());
		Self {
			description: format!("Rename {} to {}", source.display(), destination.display()),
			source,
			destination,
			fail_if_exists,
			backup: None,
			done: false,
		}
	}
}

impl Command for RenameFileCommand {
	fn description(&self) -> &str {
		&self.description
	}

	fn execute(&mut self, scope: &mut ExecutionScope<'_>) -> Result<(), CommandError> {
		if self.source == self.destination {
			return Ok(());
		}
		if !self.source.exists() {
			return Err(CommandError::Missing(self.source.clone()));
		}
		if self.destination.exists() {
			if self.fail_if_exists {
				return Err(CommandError::AlreadyExists(self.destination.clone()));
			}
			self.backup = Some(Backup::move_of(&self.destination, scope.context())?);
		}
		if let Err(err) = move_file(&self.source, &self.destination) {
			if let Some(backup) = self.backup.take() {
				backup.restore(&self.destination)?;
			}
			return Err(CommandError::Io {
				context: format!("Failed to rename {}", self.source.display()),
				source: err,
			});
		}
		self.done = true;
		Ok(())
	}

	fn undo(&mut self, _context: &CommandContext) -> Result<(), CommandError> {
		if !std::mem::take(&mut self.done) {
			return Ok(());
		}
		move_file(&self.destination, &self.source).map_err(CommandError::io(format!(
			"Failed to move {} back",
			self.destination.display()
		)))?;
		match self.backup.take() {
			Some(backup) => backup.restore(&self.destination),
			None => Ok(()),
		}
	}
}

/// Deletes a file. With rollback the file is moved to the backup directory instead.
pub struct FileDeleteCommand {
	description: String,
	path: PathBuf,
	requires_rollback: bool,
	backup: Option<Backup>,
}

impl FileDeleteCommand {
	pub fn new(path: impl Into<PathBuf>, requires_rollback: bool) -> Self {
		let path = path.into();
		Self {
			description: format!("Delete {}", path.display()),
			path,
			requires_rollback,
			backup: None,
		}
	}
}

impl Command for FileDeleteCommand {
	fn description(&self) -> &str {
		&self.description
	}

	fn requires_rollback(&self) -> bool {
		self.requires_rollback
	}

	fn execute(&mut self, scope: &mut ExecutionScope<'_>) -> Result<(), CommandError> {
		if !self.path.exists() {
			debug!(path = %self.path.display(), "File to delete does not exist");
			return Ok(());
		}
		if self.requires_rollback || scope.context().disposition() == Disposition::Robust {
			self.backup = Some(Backup::move_of(&self.path, scope.context())?);
			Ok(())
		} else {
			fs::remove_file(&self.path)
				.map_err(CommandError::io(format!("Failed to delete {}", self.path.display())))
		}
	}

	fn undo(&mut self, _context: &CommandContext) -> Result<(), CommandError> {
		match self.backup.take() {
			Some(backup) => backup.restore(&self.path),
			None => Ok(()),
		}
	}
}

/// Creates a directory with its missing parents. Undo removes only what was created.
pub struct CreateDirectoryCommand {
	description: String,
	path: PathBuf,
	created: Option<PathBuf>,
}

impl CreateDirectoryCommand {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		let path = path.into();
		Self {
			description: format!("Create directory {}", path.display()),
			path,
			created: None,
		}
	}
}

impl Command for CreateDirectoryCommand {
	fn description(&self) -> &str {
		&self.description
	}

	fn execute(&mut self, _scope: &mut ExecutionScope<'_>) -> Result<(), CommandError> {
		if self.path.is_dir() {
			return Ok(());
		}
		let topmost = self
			.path
			.ancestors()
			.take_while(|ancestor| !ancestor.exists())
			.last()
			.map(Path::to_path_buf);
		fs::create_dir_all(&self.path).map_err(CommandError::io(format!(
			"Failed to create directory {}",
			self.path.display()
		)))?;
		self.created = topmost;
		Ok(())
	}

	fn undo(&mut self, _context: &CommandContext) -> Result<(), CommandError> {
		match self.created.take() {
			Some(created) => fs::remove_dir_all(&created).map_err(CommandError::io(format!(
				"Failed to remove directory {}",
				created.display()
			))),
			None => Ok(()),
		}
	}
}

/// Deletes a directory tree. With rollback the tree is moved to the backup directory.
pub struct DeleteDirectoryCommand {
	description: String,
	path: PathBuf,
	requires_rollback: bool,
	backup: Option<Backup>,
}

impl DeleteDirectoryCommand {
	pub fn new(path: impl Into<PathBuf>, requires_rollback: bool) -> Self {
		let path = path.into();
		Self {
			description: format!("Delete directory {}", path.display()),
			path,
			requires_rollback,
			backup: None,
		}
	}
}

impl Command for DeleteDirectoryCommand {
	fn description(&self) -> &str {
		&self.description
	}

	fn requires_rollback(&self) -> bool {
		self.requires_rollback
	}

	fn execute(&mut self, scope: &mut ExecutionScope<'_>) -> Result<(), CommandError> {
		if !self.path.is_dir() {
			return Ok(());
		}
		if self.requires_rollback || scope.context().disposition() == Disposition::Robust {
			let path = backup_path(scope.context().ensure_backup_directory()?, &self.path);
			fs::rename(&self.path, &path).map_err(CommandError::io(format!(
				"Failed to move directory {} to backup",
				self.path.display()
			)))?;
			self.backup = Some(Backup { path });
			Ok(())
		} else {
			fs::remove_dir_all(&self.path).map_err(CommandError::io(format!(
				"Failed to delete directory {}",
				self.path.display()
			)))
		}
	}

	fn undo(&mut self, _context: &CommandContext) -> Result<(), CommandError> {
		match self.backup.take() {
			Some(backup) => backup.restore(&self.path),
			None => Ok(()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::command::tests::context;
	use crate::command::CommandProcessor;

	fn bytes(content: &str) -> Vec<u8> {
		content.as_bytes().to_vec()
	}

	fn entries(dir: &Path) -> usize {
		fs::read_dir(dir).map_or(0, Iterator::count)
	}

	#[test]
	fn temp_and_backup_names() {
		let dir = tempfile::tempdir().unwrap();
		let destination = dir.path().join("1.2.3.dcm");
		assert_eq!(temp_path(&destination), dir.path().join("1.2.3.dcm_tmp"));
		fs::write(dir.path().join("1.2.3.dcm_tmp"), b"").unwrap();
		assert_eq!(temp_path(&destination), dir.path().join("1.2.3.dcm_1tmp"));

		assert_eq!(backup_path(dir.path(), &destination), dir.path().join("1.2.3.dcm.bak"));
		fs::write(dir.path().join("1.2.3.dcm.bak"), b"").unwrap();
		assert_eq!(
			backup_path(dir.path(), &destination),
			dir.path().join("1.2.3.dcm.(1).bak")
		);
	}

	#[test]
	fn save_over_existing_file_is_undone() {
		let dir = tempfile::tempdir().unwrap();
		let target = dir.path().join("file.dcm");
		fs::write(&target, b"original").unwrap();

		let mut processor = CommandProcessor::new("save", context(dir.path()));
		processor.add(SaveFileCommand::new(&target, bytes("replacement"), false));
		processor.add(RenameFileCommand::new(dir.path().join("missing"), dir.path().join("x"), false));

		assert!(processor.execute().is_err());
		assert_eq!(fs::read(&target).unwrap(), b"original");
	}

	#[test]
	fn fail_if_exists() {
		let dir = tempfile::tempdir().unwrap();
		let target = dir.path().join("file.dcm");
		fs::write(&target, b"original").unwrap();

		let mut processor = CommandProcessor::new("save", context(dir.path()));
		processor.add(SaveFileCommand::new(&target, bytes("replacement"), true));
		assert!(matches!(processor.execute(), Err(CommandError::AlreadyExists(_))));
		assert_eq!(fs::read(&target).unwrap(), b"original");
	}

	#[test]
	fn resave_delete_and_failed_rename_roll_back() {
		let dir = tempfile::tempdir().unwrap();
		let file = dir.path().join("file.dcm");
		let other = dir.path().join("other.dcm");

		let mut processor = CommandProcessor::new("rollback", context(dir.path()));
		processor.add(SaveFileCommand::new(&file, bytes("content"), false));
		processor.add(FileDeleteCommand::new(&file, true));
		// source was just deleted
		processor.add(RenameFileCommand::new(&file, &other, true));

		assert!(processor.execute().is_err());
		assert!(!file.exists());
		assert!(!other.exists());
	}

	#[test]
	fn robust_save_is_idempotent_and_leaves_no_backup() {
		let dir = tempfile::tempdir().unwrap();
		let file = dir.path().join("file.dcm");
		fs::write(&file, b"content").unwrap();

		{
			let mut processor = CommandProcessor::new("idempotent", context(dir.path()));
			processor.add(SaveFileCommand::new(&file, bytes("content"), false));
			processor.add(RenameFileCommand::new(&file, &file, false));
			processor.execute().unwrap();
		}

		assert_eq!(fs::read(&file).unwrap(), b"content");
		assert_eq!(entries(&dir.path().join("backup")), 0);
		assert!(!dir.path().join("file.dcm_tmp").exists());
	}

	#[test]
	fn rename_replaces_destination_and_undo_restores_both() {
		let dir = tempfile::tempdir().unwrap();
		let source = dir.path().join("incoming");
		let destination = dir.path().join("stored");
		fs::write(&source, b"new").unwrap();
		fs::write(&destination, b"old").unwrap();

		let mut processor = CommandProcessor::new("rename", context(dir.path()));
		processor.add(RenameFileCommand::new(&source, &destination, false));
		processor.add(CopyFileCommand::new(dir.path().join("absent"), dir.path().join("y"), false));

		assert!(processor.execute().is_err());
		assert_eq!(fs::read(&source).unwrap(), b"new");
		assert_eq!(fs::read(&destination).unwrap(), b"old");
	}

	#[test]
	fn create_directory_undo_removes_only_created_part() {
		let dir = tempfile::tempdir().unwrap();
		let existing = dir.path().join("study");
		fs::create_dir(&existing).unwrap();
		let nested = existing.join("series").join("deep");

		let mut processor = CommandProcessor::new("mkdir", context(dir.path()));
		processor.add(CreateDirectoryCommand::new(&nested));
		processor.add(FileDeleteCommand::new(dir.path().join("nothing"), true));
		processor.add(RenameFileCommand::new(dir.path().join("nothing"), dir.path().join("z"), false));

		assert!(processor.execute().is_err());
		assert!(existing.is_dir());
		assert!(!existing.join("series").exists());
	}

	#[test]
	fn delete_directory_with_rollback() {
		let dir = tempfile::tempdir().unwrap();
		let folder = dir.path().join("series");
		fs::create_dir(&folder).unwrap();
		fs::write(folder.join("a.dcm"), b"a").unwrap();

		let mut processor = CommandProcessor::new("rmdir", context(dir.path()));
		processor.add(DeleteDirectoryCommand::new(&folder, true));
		processor.add(RenameFileCommand::new(dir.path().join("nothing"), dir.path().join("z"), false));

		assert!(processor.execute().is_err());
		assert_eq!(fs::read(folder.join("a.dcm")).unwrap(), b"a");
	}

	#[test]
	fn fast_disposition_removes_new_file_on_undo() {
		let dir = tempfile::tempdir().unwrap();
		let file = dir.path().join("new.dcm");
		let context = CommandContext::new(
			&dir.path().join("tmp"),
			&dir.path().join("backup"),
			Disposition::Fast,
		);

		let mut processor = CommandProcessor::new("fast", context);
		processor.add(SaveFileCommand::new(&file, bytes("content"), false));
		processor.add(RenameFileCommand::new(dir.path().join("nothing"), dir.path().join("z"), false));

		assert!(processor.execute().is_err());
		assert!(!file.exists());
	}

	#[test]
	fn fast_save_over_existing_file_takes_no_backup() {
		let dir = tempfile::tempdir().unwrap();
		let file = dir.path().join("existing.dcm");
		fs::write(&file, b"original").unwrap();
		let context = CommandContext::new(
			&dir.path().join("tmp"),
			&dir.path().join("backup"),
			Disposition::Fast,
		);

		let mut processor = CommandProcessor::new("fast", context);
		processor.add(SaveFileCommand::new(&file, bytes("replacement"), false));
		processor.add(CopyFileCommand::new(dir.path().join("absent"), dir.path().join("copy"), false));

		assert!(processor.execute().is_err());
		assert!(!processor.context().backup_directory().exists());
		// Nothing to restore from, so the replaced file is gone.
		assert!(!file.exists());
	}

	#[test]
	fn robust_delete_is_restored_without_rollback_request() {
		let dir = tempfile::tempdir().unwrap();
		let file = dir.path().join("file.dcm");
		fs::write(&file, b"content").unwrap();

		let mut processor = CommandProcessor::new("delete", context(dir.path()));
		processor.add(FileDeleteCommand::new(&file, false));
		processor.add(RenameFileCommand::new(dir.path().join("nothing"), dir.path().join("z"), false));

		assert!(processor.execute().is_err());
		assert_eq!(fs::read(&file).unwrap(), b"content");
	}

	#[test]
	fn fast_delete_without_rollback_request_is_final() {
		let dir = tempfile::tempdir().unwrap();
		let file = dir.path().join("file.dcm");
		fs::write(&file, b"content").unwrap();
		let context = CommandContext::new(
			&dir.path().join("tmp"),
			&dir.path().join("backup"),
			Disposition::Fast,
		);

		let mut processor = CommandProcessor::new("delete", context);
		processor.add(FileDeleteCommand::new(&file, false));
		processor.add(RenameFileCommand::new(dir.path().join("nothing"), dir.path().join("z"), false));

		assert!(processor.execute().is_err());
		assert!(!file.exists());
		assert!(!processor.context().backup_directory().exists());
	}
}
