use serde::{Deserialize, Serialize};

use super::playlist::{MediaPlaylist, Segment};

/// URI of the last segment folded into the output, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint(Option<String>);

impl Checkpoint {
    pub fn empty() -> Self {
        Self(None)
    }

    pub fn at(uri: impl Into<String>) -> Self {
        Self(Some(uri.into()))
    }

    pub fn uri(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

/// Segments of `playlist` strictly after the checkpointed one.
///
/// When the checkpoint is empty or has rotated out of the playlist window the
/// whole playlist is returned.
pub fn track_new_segments(playlist: &MediaPlaylist, checkpoint: &Checkpoint) -> Vec<Segment> {
    let start = checkpoint
        .uri()
        .and_then(|uri| playlist.segments.iter().position(|s| s.uri == uri))
        .map_or(0, |pos| pos + 1);
    playlist.segments[start..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn playlist(uris: &[&str]) -> MediaPlaylist {
        MediaPlaylist::new(
            uris.iter()
                .enumerate()
                .map(|(i, uri)| Segment::new(*uri, i as u64))
                .collect(),
            false,
        )
    }

    fn uris(segments: &[Segment]) -> Vec<&str> {
        segments.iter().map(|s| s.uri.as_str()).collect()
    }

    #[rstest]
    #[case::fresh_run(&["s1", "s2"], None, &["s1", "s2"])]
    #[case::tail_after_checkpoint(&["s1", "s2", "s3"], Some("s2"), &["s3"])]
    #[case::checkpoint_rotated_out(&["s2", "s3"], Some("s1"), &["s2", "s3"])]
    #[case::checkpoint_is_last(&["s1", "s2"], Some("s2"), &[])]
    #[case::empty_playlist(&[], Some("s1"), &[])]
    fn tracks_segments_after_checkpoint(
        #[case] playlist_uris: &[&str],
        #[case] checkpoint: Option<&str>,
        #[case] expected: &[&str],
    ) {
        let checkpoint = checkpoint.map_or_else(Checkpoint::empty, Checkpoint::at);
        let batch = track_new_segments(&playlist(playlist_uris), &checkpoint);
        assert_eq!(uris(&batch), expected);
        if let Some(uri) = checkpoint.uri() {
            assert!(!uris(&batch).contains(&uri));
        }
    }

    #[test]
    fn refreshed_playlist_yields_only_the_new_tail() {
        let first = playlist(&["a", "b", "c"]);
        let checkpoint = Checkpoint::at(first.segments.last().unwrap().uri.clone());
        let second = playlist(&["b", "c", "d", "e"]);
        assert_eq!(uris(&track_new_segments(&second, &checkpoint)), ["d", "e"]);
    }

    #[test]
    fn tracking_is_idempotent() {
        let p = playlist(&["a", "b", "c"]);
        let checkpoint = Checkpoint::at("a");
        assert_eq!(
            track_new_segments(&p, &checkpoint),
            track_new_segments(&p, &checkpoint)
        );
    }

    #[test]
    fn checkpoint_serializes_as_plain_value() {
        assert_eq!(serde_json::to_string(&Checkpoint::at("x")).unwrap(), "\"x\"");
        assert_eq!(serde_json::to_string(&Checkpoint::empty()).unwrap(), "null");
    }
}
