//! Transactional command processor.
//!
//! A [`CommandProcessor`] executes an ordered list of [`Command`]s. Every completed command
//! (including the sub-commands of an [`AggregateCommand`]) is pushed onto an undo stack.
//! When a command fails, the stack is unwound in reverse completion order and the
//! original failure is reported. Rollback failures are logged and never replace it.
//!
//! Commands are dropped together with the processor; dropping a command removes the
//! backups it still holds.

pub mod descriptor;
pub mod file;

use crate::descriptor::DescriptorError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// How file mutations protect existing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
	/// Back up existing destinations before they are replaced; undo restores the backup.
	#[default]
	Robust,
	/// Replaced files are not backed up and deletes only keep a backup when the command
	/// requests rollback. Undo is best effort.
	Fast,
}

#[derive(Debug, Error)]
pub enum CommandError {
	#[error("{context}: {source}")]
	Io {
		context: String,
		source: std::io::Error,
	},
	#[error("Destination {0} already exists")]
	AlreadyExists(PathBuf),
	#[error("Source {0} does not exist")]
	Missing(PathBuf),
	#[error(transparent)]
	Descriptor(#[from] DescriptorError),
	#[error("{0}")]
	Failed(String),
}

impl CommandError {
	pub fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
		let context = context.into();
		move |source| Self::Io { context, source }
	}
}

/// Callbacks invoked by the processor around command execution.
pub trait ContextHooks: Send {
	fn pre_execute(&mut self, _description: &str) {}

	fn commit(&mut self) {}

	fn rollback(&mut self) {}
}

struct NoHooks;

impl ContextHooks for NoHooks {}

/// Settings and state shared by the commands of one processor.
pub struct CommandContext {
	temp_directory: PathBuf,
	backup_directory: PathBuf,
	disposition: Disposition,
	commands_executed: usize,
	hooks: Box<dyn ContextHooks>,
}

impl CommandContext {
	/// Backups are namespaced per operation below `backup_root`.
	pub fn new(temp_root: &Path, backup_root: &Path, disposition: Disposition) -> Self {
		let operation = Uuid::new_v4().to_string();
		Self {
			temp_directory: temp_root.join(&operation),
			backup_directory: backup_root.join(operation),
			disposition,
			commands_executed: 0,
			hooks: Box::new(NoHooks),
		}
	}

	#[must_use]
	pub fn with_hooks(mut self, hooks: impl ContextHooks + 'static) -> Self {
		self.hooks = Box::new(hooks);
		self
	}

	pub fn temp_directory(&self) -> &Path {
		&self.temp_directory
	}

	pub fn backup_directory(&self) -> &Path {
		&self.backup_directory
	}

	pub const fn disposition(&self) -> Disposition {
		self.disposition
	}

	/// Number of commands started, nested commands included.
	pub const fn commands_executed(&self) -> usize {
		self.commands_executed
	}

	/// Creates the backup directory on first use.
	pub fn ensure_backup_directory(&self) -> Result<&Path, CommandError> {
		std::fs::create_dir_all(&self.backup_directory)
			.map_err(CommandError::io("Failed to create backup directory"))?;
		Ok(&self.backup_directory)
	}
}

impl Drop for CommandContext {
	fn drop(&mut self) {
		for directory in [&self.backup_directory, &self.temp_directory] {
			// Only succeeds once every command has cleaned up.
			if std::fs::remove_dir(directory).is_ok() {
				debug!(path = %directory.display(), "Removed operation directory");
			}
		}
	}
}

/// A unit of work with an optional undo.
pub trait Command: Send {
	fn description(&self) -> &str;

	/// Whether this command must be undone on failure under [`Disposition::Fast`].
	/// Under [`Disposition::Robust`] every command is undone.
	fn requires_rollback(&self) -> bool {
		true
	}

	fn execute(&mut self, scope: &mut ExecutionScope<'_>) -> Result<(), CommandError>;

	fn undo(&mut self, _context: &CommandContext) -> Result<(), CommandError> {
		Ok(())
	}
}

/// Handle passed to an executing command. Gives access to the context and
/// lets aggregates run sub-commands onto the undo stack.
pub struct ExecutionScope<'a> {
	context: &'a mut CommandContext,
	executed: &'a mut Vec<Box<dyn Command>>,
}

impl ExecutionScope<'_> {
	pub fn context(&self) -> &CommandContext {
		self.context
	}

	/// Executes a command and records it for undo once it completes.
	pub fn run(&mut self, mut command: Box<dyn Command>) -> Result<(), CommandError> {
		self.context.hooks.pre_execute(command.description());
		self.context.commands_executed += 1;
		debug!(command = command.description(), "Executing command");

		let mut nested = ExecutionScope {
			context: &mut *self.context,
			executed: &mut *self.executed,
		};
		command.execute(&mut nested)?;
		self.executed.push(command);
		Ok(())
	}
}

/// Runs a group of commands as one step. Sub-commands are undone individually.
pub struct AggregateCommand {
	description: String,
	commands: Vec<Box<dyn Command>>,
}

impl AggregateCommand {
	pub fn new(description: impl Into<String>) -> Self {
		Self {
			description: description.into(),
			commands: Vec::new(),
		}
	}

	pub fn add(&mut self, command: impl Command + 'static) {
		self.commands.push(Box::new(command));
	}
}

impl Command for AggregateCommand {
	fn description(&self) -> &str {
		&self.description
	}

	fn execute(&mut self, scope: &mut ExecutionScope<'_>) -> Result<(), CommandError> {
		for command in std::mem::take(&mut self.commands) {
			scope.run(command)?;
		}
		Ok(())
	}
}

pub struct CommandProcessor {
	description: String,
	queue: Vec<Box<dyn Command>>,
	// Dropped before the context so backups are gone when the context cleans up.
	executed: Vec<Box<dyn Command>>,
	context: CommandContext,
	failure_reason: Option<String>,
}

impl CommandProcessor {
	pub fn new(description: impl Into<String>, context: CommandContext) -> Self {
		Self {
			description: description.into(),
			queue: Vec::new(),
			executed: Vec::new(),
			context,
			failure_reason: None,
		}
	}

	pub fn add(&mut self, command: impl Command + 'static) {
		self.queue.push(Box::new(command));
	}

	pub fn add_boxed(&mut self, command: Box<dyn Command>) {
		self.queue.push(command);
	}

	pub const fn context(&self) -> &CommandContext {
		&self.context
	}

	pub fn failure_reason(&self) -> Option<&str> {
		self.failure_reason.as_deref()
	}

	/// Executes all queued commands in order. On failure every completed command is
	/// undone in reverse order and the failure is returned.
	pub fn execute(&mut self) -> Result<(), CommandError> {
		let queue = std::mem::take(&mut self.queue);
		for command in queue {
			let mut scope = ExecutionScope {
				context: &mut self.context,
				executed: &mut self.executed,
			};
			if let Err(err) = scope.run(command) {
				warn!(
					processor = self.description,
					"Command failed, rolling back: {err}"
				);
				self.failure_reason = Some(err.to_string());
				self.rollback();
				return Err(err);
			}
		}
		self.context.hooks.commit();
		Ok(())
	}

	/// Undoes every executed command in reverse completion order.
	pub fn rollback(&mut self) {
		while let Some(mut command) = self.executed.pop() {
			if self.context.disposition == Disposition::Fast && !command.requires_rollback() {
				continue;
			}
			debug!(command = command.description(), "Undoing command");
			if let Err(err) = command.undo(&self.context) {
				error!(
					processor = self.description,
					command = command.description(),
					"Failed to undo command: {err}"
				);
			}
		}
		self.context.hooks.rollback();
	}
}
