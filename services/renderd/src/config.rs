use corundum::worker::SchedulingMode;
use serde_derive::{Deserialize, Serialize};

pub const DEFAULT_SOCKET_PATH: &str = "/run/renderd/renderd.sock";

#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    Subprocess,
    Sandboxed,
    Thread,
}

impl WorkerMode {
    pub fn scheduling_mode(self) -> SchedulingMode {
        match self {
            WorkerMode::Subprocess => SchedulingMode::Subprocess,
            WorkerMode::Sandboxed => SchedulingMode::SandboxedSubprocess,
            WorkerMode::Thread => SchedulingMode::Thread,
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct ServerConfig {
    pub socket_path: String,
    pub mode: WorkerMode,
    pub seccomp_bpf: Option<String>,
    pub seccomp_policy: Option<String>,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            mode: WorkerMode::Subprocess,
            seccomp_bpf: None,
            seccomp_policy: None,
            log_level: "info".to_string(),
        }
    }
}
