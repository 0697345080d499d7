//! MRL helpers.
//!
//! An MRL is the normalized locator the library stores for every media and
//! entry point. Absolute file-system paths become `file://` MRLs with each path
//! segment percent-encoded. `file://` URIs are decoded and re-encoded the same
//! way so a file has one MRL whichever form it arrives in; any other scheme is
//! kept verbatim.

use std::path::PathBuf;

const FILE_SCHEME: &str = "file://";

/// Legacy mount alias and the storage root it points to.
const SDCARD_ALIAS: &str = "file:///sdcard";
const SDCARD_ROOT: &str = "file:///storage/emulated/0";

/// Normalize a path or URI into an MRL.
///
/// Returns `None` for empty input.
///
/// ```
/// use bridge_traits::mrl::encode_mrl;
///
/// assert_eq!(encode_mrl("/music/My Song.mp3").as_deref(), Some("file:///music/My%20Song.mp3"));
/// assert_eq!(encode_mrl("file:///music/My Song.mp3"), encode_mrl("/music/My Song.mp3"));
/// assert_eq!(encode_mrl("http://host/a.mp3").as_deref(), Some("http://host/a.mp3"));
/// assert_eq!(encode_mrl("   "), None);
/// ```
pub fn encode_mrl(uri: &str) -> Option<String> {
    let uri = uri.trim();
    if uri.is_empty() {
        return None;
    }
    if uri.starts_with('/') {
        return Some(encode_path(uri));
    }
    if let Some(rest) = uri.strip_prefix(FILE_SCHEME) {
        // Not valid UTF-8 once decoded: nothing sensible to re-encode.
        if let Ok(path) = urlencoding::decode(rest) {
            return Some(encode_path(&path));
        }
    }
    Some(uri.to_string())
}

fn encode_path(path: &str) -> String {
    let encoded: Vec<String> = path
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!("{}{}", FILE_SCHEME, encoded.join("/"))
}

/// Convert a `file://` MRL back into a local path.
pub fn mrl_to_path(mrl: &str) -> Option<PathBuf> {
    let path = mrl.strip_prefix(FILE_SCHEME)?;
    let decoded = urlencoding::decode(path).ok()?;
    Some(PathBuf::from(decoded.into_owned()))
}

/// Scheme of a URI, if it has one.
pub fn scheme(uri: &str) -> Option<&str> {
    let (scheme, _) = uri.split_once(':')?;
    let valid = !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then_some(scheme)
}

/// Whether the URI uses the `content` scheme, which is only resolvable by the
/// platform that issued it.
pub fn is_content_uri(uri: &str) -> bool {
    scheme(uri.trim()) == Some("content")
}

/// Whether `mrl` lives below the entry point `root`.
pub fn is_under(mrl: &str, root: &str) -> bool {
    let root = root.trim_end_matches('/');
    match mrl.strip_prefix(root) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// The same file addressed through the primary storage root instead of the
/// `/sdcard` alias, when `mrl` uses the alias.
pub fn sdcard_alternate(mrl: &str) -> Option<String> {
    let rest = mrl.strip_prefix(SDCARD_ALIAS)?;
    (rest.is_empty() || rest.starts_with('/')).then(|| format!("{}{}", SDCARD_ROOT, rest))
}
