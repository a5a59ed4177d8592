use std::path::PathBuf;

const ENV_CONFIG: &str = "HOSTAGENT_CONFIG";
const ENV_CONTROL_SOCKET: &str = "HOSTAGENT_CONTROL_SOCKET";
const ENV_HOSTNAME: &str = "HOSTAGENT_HOSTNAME";

const AGENT_SUBDIR: &str = "hostagent";
const FALLBACK_CONFIG_DIR: &str = "/etc";
const FALLBACK_RUNTIME_DIR: &str = "/tmp";

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Config file ($HOSTAGENT_CONFIG or <config dir>/hostagent/agent.toml)
pub fn config_path() -> PathBuf {
    let path = env_opt(ENV_CONFIG).map(PathBuf::from).unwrap_or_else(|| {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
            .join(AGENT_SUBDIR)
            .join("agent.toml")
    });
    tracing::trace!(path = %path.display(), "Resolved config path");
    path
}

/// Directory for sockets (<runtime dir>/hostagent, falling back to /tmp/hostagent)
pub fn runtime_dir() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(|| PathBuf::from(FALLBACK_RUNTIME_DIR))
        .join(AGENT_SUBDIR)
}

/// Control socket ($HOSTAGENT_CONTROL_SOCKET or <runtime dir>/control.sock)
pub fn control_socket_path() -> PathBuf {
    let path = env_opt(ENV_CONTROL_SOCKET)
        .map(PathBuf::from)
        .unwrap_or_else(|| runtime_dir().join("control.sock"));
    tracing::trace!(path = %path.display(), "Control socket path");
    path
}

/// Socket directory handed to plugin processes.
pub fn plugin_socket_dir() -> PathBuf {
    runtime_dir().join("plugins")
}

/// Hostname override ($HOSTAGENT_HOSTNAME), else the system hostname.
pub fn hostname() -> String {
    if let Some(name) = env_opt(ENV_HOSTNAME) {
        return name;
    }
    system_hostname().unwrap_or_else(|| "localhost".to_string())
}

fn system_hostname() -> Option<String> {
    let name = ::hostname::get().ok()?.to_string_lossy().trim().to_string();
    (!name.is_empty()).then_some(name)
}
