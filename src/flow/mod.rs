pub mod manager;
pub mod model;
pub mod session;
pub mod validate;

pub use manager::FlowManager;
pub use model::{Edge, Flow, NodeConfig, NodeKind};
pub use session::{Session, SessionManager};
