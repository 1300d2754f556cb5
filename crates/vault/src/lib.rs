//! File-backed vault: priority job/task queue, staged-dependency
//! promotion, and a filesystem-watch-derived change bus.

pub mod changebus;
pub mod error;
pub mod facade;
pub mod lock;
pub mod queue;
pub mod record;

pub use changebus::{ChangeBus, ChangeEvent};
pub use error::{Error, Result};
pub use facade::{Job, NewTaskSpec, NoteStore, Task, VaultFacade};
pub use record::{new_id, now_ms, JobStatus, NewJob, NewTask, Record, TaskStatus};
