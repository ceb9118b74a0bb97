//! HLS side of the engine: playlists, new-segment tracking and fetching.

pub mod fetcher;
pub mod playlist;
pub mod resolver;
pub mod tracker;

pub use fetcher::{FetchedSegment, HttpSegmentSource, SegmentFetcher, SegmentSource, WorkingBatch};
pub use playlist::{
    MediaPlaylist, ParsedPlaylist, PlaylistResolver, PlaylistStatus, Segment, Variant,
    parse_playlist, select_variant,
};
pub use resolver::{HttpPlaylistResolver, PlaylistUrlProvider, StaticUrlProvider};
pub use tracker::{Checkpoint, track_new_segments};
