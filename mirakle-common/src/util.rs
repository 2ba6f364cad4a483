//! Shared utilities for Mirakle.

use std::time::Duration;

const MS_PER_MINUTE: u128 = 60_000;
const MS_PER_HOUR: u128 = MS_PER_MINUTE * 60;

/// Format a duration the way build timings are reported:
/// `1 hrs 2 mins 3.5 secs`, `2 mins 0.25 secs`, `0.8 secs`.
pub fn pretty_time(duration: Duration) -> String {
    let ms = duration.as_millis();
    let mut result = String::new();
    if ms >= MS_PER_HOUR {
        result.push_str(&format!("{} hrs ", ms / MS_PER_HOUR));
    }
    if ms >= MS_PER_MINUTE {
        result.push_str(&format!("{} mins ", ms % MS_PER_HOUR / MS_PER_MINUTE));
    }
    let secs = (ms % MS_PER_MINUTE) as f64 / 1000.0;
    // Debug keeps the trailing `.0` for whole seconds.
    result.push_str(&format!("{secs:?} secs"));
    result
}

/// Append `value` unless an equal element is already present.
pub fn push_unique(values: &mut Vec<String>, value: String) {
    if !values.contains(&value) {
        values.push(value);
    }
}

/// Local directory as rsync expects it. Under Windows rsync runs in Cygwin,
/// so `C:\Users\me` becomes `/cygdrive/c/Users/me`.
pub fn fix_dir_for_rsync(dir: &str) -> String {
    if cfg!(windows) {
        cygwin_path(dir)
    } else {
        dir.to_string()
    }
}

fn cygwin_path(dir: &str) -> String {
    let Some(disk) = dir.chars().next() else {
        return String::new();
    };
    let path = match dir.split_once(":\\") {
        Some((_, rest)) => rest,
        None => dir,
    };
    format!(
        "/cygdrive/{}/{}",
        disk.to_ascii_lowercase(),
        path.replace('\\', "/")
    )
}
