//! Monitored channels and the filesystem layout each one owns.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Streaming platform a channel lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitch,
    Kick,
    /// Any platform reachable through a plain HLS playlist URL.
    Hls,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Twitch => "twitch",
            Self::Kick => "kick",
            Self::Hls => "hls",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    pub platform: Platform,
}

impl Channel {
    pub fn new(name: impl Into<String>, platform: Platform) -> Self {
        Self {
            name: name.into(),
            platform,
        }
    }

    /// Key used for per-channel credentials and lookups, e.g. `twitch:foo`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.platform, self.name)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] [{}]", self.platform, self.name)
    }
}

const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Replace characters that cannot appear in a file name on common platforms.
pub fn sanitize_component(input: &str) -> String {
    let replaced: String = input
        .chars()
        .map(|c| {
            if c.is_control() || INVALID_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect();

    let trimmed = replaced.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Paths exclusively owned by one channel's capture loop.
#[derive(Debug, Clone)]
pub struct ChannelPaths {
    channel_dir: PathBuf,
    work_dir: PathBuf,
}

impl ChannelPaths {
    pub fn new(output_root: &Path, channel: &Channel) -> Self {
        let channel_dir = output_root
            .join(channel.platform.as_str())
            .join(sanitize_component(&channel.name));
        let work_dir = channel_dir.join(".capture");
        Self {
            channel_dir,
            work_dir,
        }
    }

    pub fn channel_dir(&self) -> &Path {
        &self.channel_dir
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Directory holding the index-named segment files of one iteration.
    pub fn batch_dir(&self, iteration: u64) -> PathBuf {
        self.work_dir.join(format!("batch-{iteration:06}"))
    }

    /// Container produced by merging one iteration's segments.
    pub fn batch_container(&self, iteration: u64) -> PathBuf {
        self.work_dir.join(format!("batch-{iteration:06}.ts"))
    }

    pub fn append_manifest(&self) -> PathBuf {
        self.work_dir.join("append.txt")
    }

    pub fn state_file(&self) -> PathBuf {
        self.work_dir.join("state.json")
    }

    /// In-progress output of a run, named by its start date.
    pub fn output_file(&self, stem: &str) -> PathBuf {
        self.channel_dir
            .join(format!("{}.ts", sanitize_component(stem)))
    }

    /// Permanent name of a finished capture.
    pub fn final_file(&self, stem: &str, extension: &str) -> PathBuf {
        self.channel_dir
            .join(format!("{}.{extension}", sanitize_component(stem)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_invalid_characters() {
        assert_eq!(sanitize_component("a/b:c"), "a_b_c");
        assert_eq!(sanitize_component(" .hidden. "), "hidden");
        assert_eq!(sanitize_component(""), "unnamed");
    }

    #[test]
    fn channels_on_different_platforms_do_not_share_directories() {
        let root = Path::new("/vods");
        let twitch = ChannelPaths::new(root, &Channel::new("alice", Platform::Twitch));
        let kick = ChannelPaths::new(root, &Channel::new("alice", Platform::Kick));
        assert_ne!(twitch.channel_dir(), kick.channel_dir());
        assert_eq!(twitch.channel_dir(), Path::new("/vods/twitch/alice"));
    }

    #[test]
    fn batch_paths_are_numbered() {
        let paths = ChannelPaths::new(Path::new("/v"), &Channel::new("bob", Platform::Hls));
        assert_eq!(
            paths.batch_container(7),
            Path::new("/v/hls/bob/.capture/batch-000007.ts")
        );
        assert_eq!(paths.batch_dir(7), Path::new("/v/hls/bob/.capture/batch-000007"));
    }

    #[test]
    fn display_includes_platform() {
        let channel = Channel::new("carol", Platform::Kick);
        assert_eq!(channel.to_string(), "[kick] [carol]");
        assert_eq!(channel.key(), "kick:carol");
    }
}
