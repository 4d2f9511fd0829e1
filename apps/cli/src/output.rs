//! Output formatting utilities

/// Format speed as human-readable
pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", human_bytes::human_bytes(bytes_per_sec as f64))
}

/// Format duration as human-readable
pub fn format_eta(seconds: u64) -> String {
    if seconds == 0 {
        return "-".to_string();
    }

    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}
