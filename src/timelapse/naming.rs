//! Job-name handling and output naming.
//!
//! Job names arrive from the network (slicer job paths, print-status
//! filenames) and end up in filesystem paths, so sanitization here is a hard
//! input-validation boundary: reject anything outside a small allow-list
//! instead of trying to rewrite it.

use std::path::Path;

use crate::error::{Error, Result};

/// Longest accepted job name; printers generate long slicer names but
/// nothing legitimate approaches this.
const MAX_NAME_LEN: usize = 128;

/// Validate an externally derived job name for use as a path component.
///
/// Rules: non-empty, at most `MAX_NAME_LEN` chars, no path separators, no
/// `..`, no leading dot, characters limited to `[A-Za-z0-9._ -]`.
pub fn sanitize_job_name(name: &str) -> Result<&str> {
    if name.is_empty() {
        return Err(Error::Validation("empty job name".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::Validation(format!(
            "job name longer than {} chars",
            MAX_NAME_LEN
        )));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(Error::Validation(format!(
            "job name '{}' contains a path separator",
            name
        )));
    }
    if name.contains("..") {
        return Err(Error::Validation(format!(
            "job name '{}' contains a traversal sequence",
            name
        )));
    }
    if name.starts_with('.') {
        return Err(Error::Validation(format!(
            "job name '{}' starts with a dot",
            name
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ' ' | '-')))
    {
        return Err(Error::Validation(format!(
            "job name '{}' contains disallowed character '{}'",
            name, bad
        )));
    }
    Ok(name)
}

/// Derive the job name from a slicer job-file path:
/// "/data/gcodes/Benchy_PLA_1h.gcode" -> "Benchy_PLA_1h".
/// The derived component still has to pass sanitization.
pub fn job_name_from_path(filepath: &str) -> Result<String> {
    let base = filepath
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filepath)
        .trim();
    let name = base
        .strip_suffix(".gcode")
        .or_else(|| base.strip_suffix(".GCODE"))
        .unwrap_or(base);
    sanitize_job_name(name)?;
    Ok(name.to_string())
}

/// Next free per-job sequence number, found by scanning existing output
/// files named `<job>_<NN>...` so repeated jobs never overwrite each other.
pub fn next_sequence(output_dir: &Path, job_name: &str) -> u32 {
    let prefix = format!("{}_", job_name);
    let mut max_seq = 0u32;
    if let Ok(entries) = std::fs::read_dir(output_dir) {
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(seq) = digits.parse::<u32>() {
                max_seq = max_seq.max(seq);
            }
        }
    }
    max_seq + 1
}

/// Output video name: `<job>_<NN>.mp4`.
pub fn video_name(job_name: &str, sequence: u32) -> String {
    format!("{}_{:02}.mp4", job_name, sequence)
}

/// Thumbnail name: `<job>_<NN>_<frames>.jpg`. The frame count is encoded in
/// the name so listings can show it without opening the video.
pub fn thumbnail_name(job_name: &str, sequence: u32, frame_count: u32) -> String {
    format!("{}_{:02}_{}.jpg", job_name, sequence, frame_count)
}

/// Temp-dir frame file name for the given zero-based index.
pub fn frame_name(index: u32) -> String {
    format!("frame_{:04}.jpg", index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_slicer_names() {
        assert!(sanitize_job_name("Benchy_PLA_0.2_1h30m").is_ok());
        assert!(sanitize_job_name("calibration cube v2").is_ok());
    }

    #[test]
    fn rejects_separators_and_traversal() {
        assert!(sanitize_job_name("../../etc/passwd").is_err());
        assert!(sanitize_job_name("a/b").is_err());
        assert!(sanitize_job_name("a\\b").is_err());
        assert!(sanitize_job_name("innocent..name").is_err());
        assert!(sanitize_job_name(".hidden").is_err());
    }

    #[test]
    fn rejects_shell_metacharacters() {
        assert!(sanitize_job_name("job;rm -rf").is_err());
        assert!(sanitize_job_name("job$(id)").is_err());
        assert!(sanitize_job_name("job'quote").is_err());
    }

    #[test]
    fn derives_name_from_gcode_path() {
        assert_eq!(
            job_name_from_path("/data/gcodes/Benchy_PLA.gcode").unwrap(),
            "Benchy_PLA"
        );
        assert_eq!(job_name_from_path("plain_name").unwrap(), "plain_name");
    }

    #[test]
    fn path_derivation_still_validates() {
        assert!(job_name_from_path("/data/gcodes/bad;name.gcode").is_err());
    }

    #[test]
    fn sequence_scan_skips_other_jobs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("benchy_01.mp4"), b"x").unwrap();
        std::fs::write(dir.path().join("benchy_03.mp4"), b"x").unwrap();
        std::fs::write(dir.path().join("other_09.mp4"), b"x").unwrap();

        assert_eq!(next_sequence(dir.path(), "benchy"), 4);
        assert_eq!(next_sequence(dir.path(), "fresh"), 1);
    }

    #[test]
    fn names_are_deterministic() {
        assert_eq!(video_name("benchy", 4), "benchy_04.mp4");
        assert_eq!(thumbnail_name("benchy", 4, 120), "benchy_04_120.jpg");
        assert_eq!(frame_name(7), "frame_0007.jpg");
    }
}
