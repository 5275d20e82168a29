/// Renders seconds as `m:ss` for the recording indicator.
pub fn format_duration(seconds: u64) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}
