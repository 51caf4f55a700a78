//! Textual path handling for paths recorded by a foreign build.
//!
//! Nothing here touches the file system: the tree a binary was built in
//! usually doesn't exist on the machine analyzing it, so `..` is collapsed
//! lexically and symlinks are never resolved.
//!
//! All output uses forward slashes, whatever the originating platform.

/// Strategy for turning a path recorded in debug info into the form used in
/// results.
///
/// Implementations are injected through `DiscoveryOptions` rather than being
/// picked from the host OS, so Windows and Cygwin binaries decode the same on
/// any machine.
pub trait PathNormalizer: std::fmt::Debug + Send + Sync {
    fn normalize(&self, path: &str) -> String;
}

/// Paths from a POSIX build. Backslashes are still turned into slashes,
/// because MinGW toolchains happily record mixed separators.
#[derive(Copy, Clone, Debug, Default)]
pub struct PosixPaths;

impl PathNormalizer for PosixPaths {
    fn normalize(&self, path: &str) -> String {
        clean_path(&to_slashes(path))
    }
}

/// Paths from a native Windows build. Drive letters are upper-cased so that
/// `c:/src` and `C:/src` compare equal.
#[derive(Copy, Clone, Debug, Default)]
pub struct WindowsPaths;

impl PathNormalizer for WindowsPaths {
    fn normalize(&self, path: &str) -> String {
        let mut path = clean_path(&to_slashes(path));
        if drive_prefix_len(&path) > 0 {
            let drive = path[..1].to_ascii_uppercase();
            path.replace_range(..1, &drive);
        }
        path
    }
}

/// Paths from a Cygwin build, mapped into the Cygwin POSIX namespace.
///
/// `root` is the Windows location of the Cygwin installation (e.g.
/// `C:/cygwin`); paths beneath it become `/...`. Any other drive path becomes
/// `/cygdrive/<letter>/...`.
#[derive(Clone, Debug)]
pub struct CygwinPaths {
    pub root: String,
}

impl CygwinPaths {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }
}

impl PathNormalizer for CygwinPaths {
    fn normalize(&self, path: &str) -> String {
        let path = clean_path(&to_slashes(path));
        let root = clean_path(&to_slashes(&self.root));

        if !root.is_empty() && drive_prefix_len(&path) > 0 {
            if let Some(rest) = strip_prefix_ignore_case(&path, &root) {
                if rest.is_empty() {
                    return "/".to_string();
                }
                if rest.starts_with('/') {
                    return rest.to_string();
                }
            }
        }

        let prefix = drive_prefix_len(&path);
        if prefix > 0 {
            let letter = path[..1].to_ascii_lowercase();
            let rest = path[prefix..].trim_start_matches('/');
            if rest.is_empty() {
                format!("/cygdrive/{}", letter)
            } else {
                format!("/cygdrive/{}/{}", letter, rest)
            }
        } else {
            path
        }
    }
}

fn strip_prefix_ignore_case<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if path.len() >= prefix.len()
        && path.is_char_boundary(prefix.len())
        && path[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        Some(&path[prefix.len()..])
    } else {
        None
    }
}

/// Replaces every backslash with a forward slash.
pub fn to_slashes(path: &str) -> String {
    path.replace('\\', "/")
}

/// Length of a `X:` drive prefix, or 0.
fn drive_prefix_len(path: &str) -> usize {
    let b = path.as_bytes();
    if b.len() >= 2 && b[0].is_ascii_alphabetic() && b[1] == b':' {
        2
    } else {
        0
    }
}

/// Length of the root of a slash-separated path: `/`, `X:/`, `X:` or
/// `//host/share/`. Relative paths have no root.
fn root_len(path: &str) -> usize {
    let drive = drive_prefix_len(path);
    if drive > 0 {
        return if path[drive..].starts_with('/') { drive + 1 } else { drive };
    }
    if let Some(unc) = path.strip_prefix("//") {
        // //host/share is the root of a UNC path.
        let mut parts = unc.splitn(3, '/');
        let host = parts.next().unwrap_or("");
        let share = parts.next();
        if !host.is_empty() {
            return match share {
                Some(share) => {
                    let len = 2 + host.len() + 1 + share.len();
                    if path.len() > len { len + 1 } else { len }
                }
                None => path.len(),
            };
        }
    }
    if path.starts_with('/') {
        1
    } else {
        0
    }
}

/// Whether `path` is absolute on any of the supported platforms.
pub fn is_absolute(path: &str) -> bool {
    let path = to_slashes(path);
    root_len(&path) > 0 && !(drive_prefix_len(&path) == 2 && root_len(&path) == 2)
}

/// Collapses `.` and `..` segments and duplicate slashes.
///
/// Collapsing never crosses the root: `/a/../..` is `/`, `C:/a/../../b` is
/// `C:/b`. Relative paths keep the `..` segments that can't be resolved, so
/// `a/../../b` is `../b`. Expects forward slashes.
pub fn clean_path(path: &str) -> String {
    let root_end = root_len(path);
    let (root, rest) = path.split_at(root_end);
    let is_rooted = !root.is_empty();

    let mut segments: Vec<&str> = Vec::new();
    for segment in rest.split('/') {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(&last) if last != ".." => {
                    segments.pop();
                }
                _ => {
                    if !is_rooted {
                        segments.push("..");
                    }
                }
            },
            s => segments.push(s),
        }
    }

    let mut out = String::with_capacity(path.len());
    out.push_str(root);
    out.push_str(&segments.join("/"));
    if out.is_empty() && !path.is_empty() {
        out.push('.');
    }
    out
}

/// Joins `other` onto `base` unless `other` is already absolute.
///
/// Special names like `<stdin>` or `<built-in>` are returned unchanged.
pub fn join_path(base: &str, other: &str) -> String {
    if other.starts_with('<') && other.ends_with('>') {
        return other.to_string();
    }
    if base.is_empty() || is_absolute(other) {
        return other.to_string();
    }
    if other.is_empty() {
        return base.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches(|c| c == '/' || c == '\\'),
        other.trim_start_matches(|c| c == '/' || c == '\\')
    )
}

/// The directory part of a normalized path, or `None` for a bare file name.
pub fn parent(path: &str) -> Option<&str> {
    let idx = path.rfind('/')?;
    let root = root_len(path);
    if idx < root {
        // The only slash is part of the root.
        if root == 0 || path.len() == root {
            None
        } else {
            Some(&path[..root])
        }
    } else {
        Some(&path[..idx])
    }
}

/// Whether `path` equals `dir` or lies beneath it. Both must be normalized.
pub fn is_under(path: &str, dir: &str) -> bool {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        return path.starts_with('/');
    }
    path == dir
        || (path.len() > dir.len()
            && path.starts_with(dir)
            && path.as_bytes()[dir.len()] == b'/')
}
