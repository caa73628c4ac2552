pub mod broadcast;
pub mod catalog;
pub mod condition;
pub mod coordinator;
pub mod interpreter;
pub mod journal;
pub mod net;
pub mod registry;
pub mod sandbox;
pub mod supervisor;

pub use broadcast::{Broadcaster, WatcherHandle};
pub use catalog::DirectoryCatalog;
pub use condition::choose_edge;
pub use coordinator::{DirectorySource, ProjectCoordinator};
pub use interpreter::{Interpreter, RunOutcome, RunReport};
pub use journal::RunJournal;
pub use net::ReqwestClient;
pub use registry::RunRegistry;
pub use sandbox::{ScriptOutcome, ScriptSandbox};
pub use supervisor::RunSupervisor;
