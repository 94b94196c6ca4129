//! Path handling
//!
//! Paths use `/` separators and may carry a `VOLUME:` prefix. A rooted
//! path decomposes with an empty leading component, which is how FS
//! drivers tell "from the root" apart from a bare name.

use alloc::string::String;
use alloc::vec::Vec;

pub const PATH_SEPARATOR: char = '/';
pub const VOLUME_SEPARATOR: char = ':';

/// Split a path into its components. A leading separator produces an
/// empty first component.
pub fn decompose_path(path: &str) -> Vec<String> {
    let mut components: Vec<String> = Vec::new();
    let mut current = String::new();

    for ch in path.chars() {
        if ch == PATH_SEPARATOR {
            components.push(core::mem::take(&mut current));
        } else {
            current.push(ch);
        }
    }
    components.push(current);
    components
}

/// Split `VOLUME:/rest` into `(volume, rest)`. Returns `None` when the
/// path carries no well-formed volume prefix.
pub fn split_volume(path: &str) -> Option<(&str, &str)> {
    let colon = path.find(VOLUME_SEPARATOR)?;
    let (volume, tail) = path.split_at(colon);
    let tail = &tail[1..];
    if volume.is_empty() || !tail.starts_with(PATH_SEPARATOR) {
        return None;
    }
    Some((volume, &tail[1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rooted_paths_have_an_empty_head() {
        assert_eq!(decompose_path("/boot/kernel"), ["", "boot", "kernel"]);
        assert_eq!(decompose_path("/"), ["", ""]);
    }

    #[test]
    fn bare_names_are_single_components() {
        assert_eq!(decompose_path("hello.txt"), ["hello.txt"]);
        assert_eq!(decompose_path("a/b"), ["a", "b"]);
    }

    #[test]
    fn volume_prefixes() {
        assert_eq!(split_volume("C:/docs/readme"), Some(("C", "docs/readme")));
        assert_eq!(split_volume("SYS:/"), Some(("SYS", "")));
        assert_eq!(split_volume("/rooted"), None);
        assert_eq!(split_volume("C:no-slash"), None);
        assert_eq!(split_volume("plain"), None);
    }
}
