use std::path::Path;

/// Returns the directory that holds `path`.
///
/// Relative paths without a directory component live in ".", and "/" is its own parent.
pub(crate) fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if parent.as_os_str().is_empty() => Path::new("."),
        Some(parent) => parent,
        None => Path::new("/"),
    }
}
