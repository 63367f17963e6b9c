pub mod echo;
pub mod ephemeral;
pub mod registry;
pub mod runner;

pub use echo::EchoTool;
pub use ephemeral::{EphemeralStore, InMemoryEphemeralStore, QueryEphemeralTool};
pub use registry::{Tool, ToolRegistry};
pub use runner::{ToolRunResult, ToolRunner};
