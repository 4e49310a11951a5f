use std::{fs, io, path::Path};

/// Shorten text for labels and log lines, marking binary content.
pub(crate) fn shorten_text(content: &[u8], n: usize) -> String {
    let (slice, shortened) = if content.len() > n {
        (&content[..n.saturating_sub(3)], true)
    } else {
        (content, false)
    };
    let text = match std::str::from_utf8(slice) {
        Ok(text) => text,
        Err(_) => return "<BINARY>".to_string(),
    };
    if shortened {
        format!("{}...", text.trim_end())
    } else {
        text.to_string()
    }
}

#[cfg(unix)]
pub fn make_executable(path: impl AsRef<Path>) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let path = path.as_ref();
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o111);
    fs::set_permissions(path, perms)
}

#[cfg(unix)]
pub fn make_nonwritable(path: impl AsRef<Path>) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let path = path.as_ref();
    let mut perms = fs::symlink_metadata(path)?.permissions();
    perms.set_mode(perms.mode() & !0o222);
    fs::set_permissions(path, perms)
}

#[cfg(unix)]
pub fn make_writable(path: impl AsRef<Path>) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let path = path.as_ref();
    let mut perms = fs::symlink_metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o200);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
pub fn make_executable(_path: impl AsRef<Path>) -> io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
pub fn make_nonwritable(path: impl AsRef<Path>) -> io::Result<()> {
    let path = path.as_ref();
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
pub fn make_writable(path: impl AsRef<Path>) -> io::Result<()> {
    let path = path.as_ref();
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(false);
    fs::set_permissions(path, perms)
}
