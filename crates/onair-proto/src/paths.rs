use std::path::PathBuf;

pub const DAEMON_TCP_PORT: u16 = 9470;
const DAEMON_TCP_HOST: &str = "127.0.0.1";

pub fn daemon_address() -> String {
    format!("{}:{}", DAEMON_TCP_HOST, DAEMON_TCP_PORT)
}

pub fn data_dir() -> PathBuf {
    // On macOS and Linux, use ~/.local/share/onair/ (XDG standard)
    // instead of macOS Application Support for consistency
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join("onair")
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("onair")
    }
}

pub fn config_dir() -> PathBuf {
    // On macOS and Linux, always use ~/.config/onair/
    // (avoid macOS Application Support folder for consistency)
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("onair")
    }
    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("onair")
    }
}
