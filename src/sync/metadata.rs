use serde::{Deserialize, Serialize};

/// Extensions (lowercase, without the dot) treated as audio.
pub const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "wav", "ogg", "flac", "m4a", "aac", "wma", "opus", "3gp", "amr",
];

pub const UNKNOWN_ARTIST: &str = "Unknown Artist";

const ARTIST_TITLE_SEPARATOR: &str = " - ";

/// Artist and title derived from an object key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub artist: String,
    pub title: String,
}

/// Whether a key names an audio object.
///
/// The extension is compared case-insensitively. A key without any `.` is
/// assumed to be audio.
pub fn is_audio_key(key: &str) -> bool {
    match key.rsplit_once('.') {
        None => true,
        Some((_, ext)) => {
            let ext = ext.to_ascii_lowercase();
            AUDIO_EXTENSIONS.contains(&ext.as_str())
        }
    }
}

/// Drop a trailing `.ext`, where `ext` is non-empty and has no `/` or `.`.
///
/// `albums.v2/track` keeps its dot because the suffix crosses a path
/// separator.
pub fn strip_extension(key: &str) -> &str {
    match key.rsplit_once('.') {
        Some((stem, ext)) if !ext.is_empty() && !ext.contains('/') => stem,
        _ => key,
    }
}

/// Split `"Artist - Title.ext"` into its parts.
///
/// With fewer than two parts the artist is [`UNKNOWN_ARTIST`] and the title
/// is the key without its extension. Parts after the second are ignored.
pub fn derive_metadata(key: &str) -> TrackMetadata {
    let base = strip_extension(key);
    let mut parts = base.split(ARTIST_TITLE_SEPARATOR);
    match (parts.next(), parts.next()) {
        (Some(artist), Some(title)) => TrackMetadata {
            artist: artist.trim().to_string(),
            title: title.trim().to_string(),
        },
        _ => TrackMetadata {
            artist: UNKNOWN_ARTIST.to_string(),
            title: base.to_string(),
        },
    }
}
