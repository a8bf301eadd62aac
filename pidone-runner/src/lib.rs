pub mod environment;
pub mod pipe;
pub mod process;
pub mod pty;
pub mod reaper;
pub mod relay;
pub mod signals;
pub mod supervisor;
pub mod terminal;

pub use environment::{CredentialProvider, SecretsDirProvider};
pub use process::{ChildHandle, ProcessConfig, ProcessGroup};
pub use supervisor::{Supervisor, SupervisorConfig};
