//! Optional playlist snapshot persisted on clean shutdown and restored on
//! startup: a header line `# cursor N` followed by one path per line.

use std::io::Write;
use std::path::Path;

use crate::playlist::Playlist;

pub fn save(playlist: &Playlist, path: &Path) -> std::io::Result<()> {
    let mut out = String::new();
    out.push_str(&format!("# cursor {}\n", playlist.cursor()));
    for entry in playlist.entries() {
        out.push_str(entry);
        out.push('\n');
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(path)?;
    file.write_all(out.as_bytes())
}

pub fn load(path: &Path) -> std::io::Result<Playlist> {
    let text = std::fs::read_to_string(path)?;
    let mut playlist = Playlist::new();
    let mut cursor: i64 = -1;

    for (line_no, line) in text.lines().enumerate() {
        if line_no == 0 {
            if let Some(rest) = line.strip_prefix("# cursor ") {
                cursor = rest.trim().parse().unwrap_or(-1);
                continue;
            }
        }
        if line.is_empty() {
            continue;
        }
        playlist.append(line.to_string());
    }

    if cursor >= 0 && (cursor as usize) < playlist.len() {
        playlist.set_cursor(cursor);
    }

    Ok(playlist)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_a_tempfile() {
        let dir = std::env::temp_dir().join(format!("cadence-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("playlist.snapshot");

        let mut playlist = Playlist::new();
        playlist.append("/a.ogg".to_string());
        playlist.append("/b.flac".to_string());
        playlist.set_cursor(1);

        save(&playlist, &path).unwrap();
        let restored = load(&path).unwrap();

        assert_eq!(restored.entries(), playlist.entries());
        assert_eq!(restored.cursor(), 1);

        std::fs::remove_file(&path).ok();
        std::fs::remove_dir(&dir).ok();
    }
}
