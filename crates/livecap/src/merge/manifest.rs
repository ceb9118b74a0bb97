//! Concat-demuxer manifests: one `file '<path>'` line per input, in playback
//! order.

use std::path::{Path, PathBuf};

use crate::{CaptureError, Result};

fn quote(path: &Path) -> String {
    // A single quote inside a quoted string is written as '\''
    format!("'{}'", path.to_string_lossy().replace('\'', r"'\''"))
}

pub fn render_manifest(files: &[PathBuf]) -> String {
    let mut out = String::new();
    for file in files {
        out.push_str("file ");
        out.push_str(&quote(file));
        out.push('\n');
    }
    out
}

pub async fn write_manifest(manifest: &Path, files: &[PathBuf]) -> Result<()> {
    tokio::fs::write(manifest, render_manifest(files))
        .await
        .map_err(|e| CaptureError::io_path("writing manifest", manifest, e))
}

fn unquote(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut quoted = false;
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => quoted = !quoted,
            '\\' if !quoted => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            c => out.push(c),
        }
    }
    out
}

/// Parse manifest text. Relative entries are resolved against `base_dir`.
pub fn parse_manifest(text: &str, base_dir: &Path) -> Vec<PathBuf> {
    text.lines()
        .map(str::trim)
        .filter_map(|line| line.strip_prefix("file "))
        .map(|value| {
            let path = PathBuf::from(unquote(value.trim()));
            if path.is_absolute() {
                path
            } else {
                base_dir.join(path)
            }
        })
        .collect()
}

pub async fn read_manifest(manifest: &Path) -> Result<Vec<PathBuf>> {
    let text = tokio::fs::read_to_string(manifest)
        .await
        .map_err(|e| CaptureError::io_path("reading manifest", manifest, e))?;
    let base_dir = manifest.parent().unwrap_or_else(|| Path::new("."));
    Ok(parse_manifest(&text, base_dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_line_per_file_in_order() {
        let text = render_manifest(&[PathBuf::from("/w/00000.ts"), PathBuf::from("/w/00001.ts")]);
        assert_eq!(text, "file '/w/00000.ts'\nfile '/w/00001.ts'\n");
    }

    #[test]
    fn single_quotes_are_escaped_and_read_back() {
        let path = PathBuf::from("/vods/it's live/00000.ts");
        let text = render_manifest(std::slice::from_ref(&path));
        assert_eq!(text, "file '/vods/it'\\''s live/00000.ts'\n");
        assert_eq!(parse_manifest(&text, Path::new("/")), vec![path]);
    }

    #[test]
    fn relative_entries_resolve_against_manifest_dir() {
        let parsed = parse_manifest("file 'a.ts'\n# comment\n", Path::new("/work"));
        assert_eq!(parsed, vec![PathBuf::from("/work/a.ts")]);
    }
}
