// Purpose: Implement separator-agnostic path string helpers for wrapped command lines.
// Inputs/Outputs: Pure string transforms over paths that may use `\` or `/`.
// Invariants: Helpers must treat both separators identically regardless of host OS.
// Gotchas: Wrapped MSVC command lines carry Windows-style paths even on non-Windows hosts.

fn last_separator(path: &str) -> Option<usize> {
    path.rfind(['\\', '/'])
}

pub fn ends_with_separator(path: &str) -> bool {
    path.ends_with('\\') || path.ends_with('/')
}

/// Returns the final path component, optionally with its extension removed.
pub fn file_part(path: &str, with_extension: bool) -> String {
    let base = match last_separator(path) {
        Some(pos) => &path[pos + 1..],
        None => path,
    };
    if with_extension {
        return base.to_string();
    }
    match base.rfind('.') {
        Some(pos) => base[..pos].to_string(),
        None => base.to_string(),
    }
}

/// Returns the extension of the final component including the dot, or "".
pub fn get_extension(path: &str) -> &str {
    let base_start = last_separator(path).map(|pos| pos + 1).unwrap_or(0);
    let base = &path[base_start..];
    match base.rfind('.') {
        Some(pos) => &base[pos..],
        None => "",
    }
}

pub fn change_extension(path: &str, new_ext: &str) -> String {
    let ext = get_extension(path);
    format!("{}{}", &path[..path.len() - ext.len()], new_ext)
}

pub fn append_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        return name.to_string();
    }
    if ends_with_separator(dir) {
        return format!("{}{}", dir, name);
    }
    format!("{}{}{}", dir, std::path::MAIN_SEPARATOR, name)
}
