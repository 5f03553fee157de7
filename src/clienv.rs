use std::path::PathBuf;

/// Environment variables the daemon honors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvVar {
    Config,
    Socket,
    PidFile,
    Log,
}

impl EnvVar {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvVar::Config => "CPACFSTATSD_CONFIG",
            EnvVar::Socket => "CPACFSTATSD_SOCKET",
            EnvVar::PidFile => "CPACFSTATSD_PID_FILE",
            EnvVar::Log => "CPACFSTATSD_LOG",
        }
    }
}

pub const DEFAULT_CONFIG_PATH: &str = "/etc/cpacfstatsd.toml";
pub const DEFAULT_SOCKET_PATH: &str = "/run/cpacfstatsd_socket";
pub const DEFAULT_PID_PATH: &str = "/run/cpacfstatsd.pid";
pub const DEFAULT_LOG_PATH: &str = "/var/log/cpacfstatsd.log";
pub const DEFAULT_SOCKET_GROUP: &str = "cpacfstats";

/// Non-empty value of an environment variable
fn env_opt(var: EnvVar) -> Option<String> {
    std::env::var(var.as_str()).ok().filter(|v| !v.is_empty())
}

fn env_path(var: EnvVar) -> Option<PathBuf> {
    let path = env_opt(var).map(PathBuf::from);
    tracing::trace!(value = ?path, "{} env var", var.as_str());
    path
}

/// Config file path ($CPACFSTATSD_CONFIG or /etc/cpacfstatsd.toml)
pub fn config_path() -> PathBuf {
    let path = env_path(EnvVar::Config).unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    tracing::trace!(path = %path.display(), "Config path");
    path
}

/// Socket path override ($CPACFSTATSD_SOCKET)
pub fn socket_path() -> Option<PathBuf> {
    env_path(EnvVar::Socket)
}

/// PID file path override ($CPACFSTATSD_PID_FILE)
pub fn pid_path() -> Option<PathBuf> {
    env_path(EnvVar::PidFile)
}

/// Log file path override ($CPACFSTATSD_LOG)
pub fn log_path() -> Option<PathBuf> {
    env_path(EnvVar::Log)
}
