pub mod config;
pub mod control;
pub mod definition;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;
pub mod vars;

pub use config::AppConfig;
pub use control::ControlMessage;
pub use definition::{Edge, Node, WorkflowDefinition};
pub use error::{FlowloomError, Result};
pub use event::{Envelope, EventBus, FlowEvent};
pub use types::*;
pub use vars::StoreVars;
