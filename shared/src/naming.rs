/// Filesystem-safe naming for downloaded media.

const FORBIDDEN: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|', '\n', '\r', '\t'];

/// Strip characters Windows and POSIX filesystems reject, then turn spaces
/// into underscores.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .filter(|c| !FORBIDDEN.contains(c))
        .map(|c| if c == ' ' { '_' } else { c })
        .collect()
}
