use std::path::{Component, Path, PathBuf};

/// Ignore errors about nonexisting files.
pub fn exist_then<T: Default>(r: std::io::Result<T>) -> std::io::Result<T> {
    match r {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        Err(_) => Ok(T::default()),
        Ok(x) => Ok(x),
    }
}

/// Join an absolute path from inside a contained root onto that root.
///
/// `/boot/efi` under `/tmp/efimg.x` becomes `/tmp/efimg.x/boot/efi`; `..` can't climb out.
#[must_use]
pub fn rooted(root: &Path, inner: &Path) -> PathBuf {
    let mut out = root.to_path_buf();
    for comp in inner.components() {
        match comp {
            Component::Normal(c) => out.push(c),
            Component::ParentDir if out != root => {
                out.pop();
            }
            _ => {}
        }
    }
    out
}

/// Decode the octal escapes the kernel uses for whitespace in `/proc/self/mounts`.
#[must_use]
pub fn unescape_mount_path(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if let [b'\\', a @ b'0'..=b'7', b @ b'0'..=b'7', c @ b'0'..=b'7', ..] = &bytes[i..] {
            let code = u32::from(a - b'0') * 64 + u32::from(b - b'0') * 8 + u32::from(c - b'0');
            if let Ok(byte) = u8::try_from(code) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
