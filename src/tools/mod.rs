pub mod echo;
pub mod executor;
pub mod filesystem;
pub mod registry;
pub mod router;
pub mod shell;

pub use echo::EchoTool;
pub use executor::{ExecutionFailure, ToolExecutor};
pub use filesystem::{ReadFileTool, SafeFs, WriteFileTool};
pub use registry::{Capability, Tool, ToolFailure, ToolOutput, ToolRegistry, ValidationResult};
pub use router::{BoundTool, ToolRouter};
pub use shell::ShellTool;
