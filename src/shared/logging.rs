use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn runtime_log_path(state_root: &Path) -> PathBuf {
    state_root.join("logs/runtime.log")
}

pub fn security_log_path(state_root: &Path) -> PathBuf {
    state_root.join("logs/security.log")
}

/// Best-effort append; log lines never fail the caller.
pub fn append_runtime_log_line(state_root: &Path, level: &str, event: &str, detail: &str) {
    append_line(
        &runtime_log_path(state_root),
        &format!("{level} {event} {detail}"),
    );
}

pub fn append_security_log_line(state_root: &Path, event: &str, detail: &str) {
    append_line(
        &security_log_path(state_root),
        &format!("security {event} {detail}"),
    );
}

fn append_line(path: &Path, line: &str) {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let _ = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| writeln!(file, "{line}"));
}
