use chrono::{DateTime, Utc};

/// Human-friendly age of a timestamp ("just now", "5m ago", "2h ago", "3d ago")
pub fn age_display(since: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let minutes = (now - since).num_minutes();
    if minutes < 1 {
        // Also covers clock skew
        "just now".to_string()
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else if minutes < 1440 {
        let hours = minutes / 60;
        if minutes % 60 >= 30 {
            // Round up: 1h 30m+ becomes 2h
            format!("{}h ago", hours + 1)
        } else {
            format!("{}h ago", hours)
        }
    } else {
        let days = minutes / 1440;
        if (minutes % 1440) / 60 >= 12 {
            format!("{}d ago", days + 1)
        } else {
            format!("{}d ago", days)
        }
    }
}

/// Show just enough of a bearer token to tell tokens apart
pub fn mask_token(token: &str) -> String {
    let visible: String = token.chars().take(6).collect();
    if visible.chars().count() < token.chars().count() {
        format!("{}…", visible)
    } else {
        "*".repeat(token.chars().count())
    }
}
