//! etch-bridge: Debug Adapter Protocol bridge for the Etch debug server.

pub mod bridge;
pub mod config;
pub mod correlation;
pub mod dap;
pub mod process;
pub mod server;
pub mod session;
pub mod workspace;

pub use config::SessionConfig;
pub use process::{
    DebuggeeSpawner, ExecSpawner, LaunchError, LaunchSpec, ProcessEvent, ProcessHandle,
};
pub use server::serve;
pub use session::{Session, SessionError, SessionState};
pub use workspace::{WorkspaceResolver, WorkspaceRoots};
