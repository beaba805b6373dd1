//! Topic Filter Matching
//!
//! MQTT wildcard matching used by endpoints to route a delivered PUBLISH to
//! every subscription whose filter covers the topic.

/// Check whether `topic` is matched by the subscription `filter`.
///
/// `+` matches exactly one level, `#` matches the remaining levels
/// (including none). Topics starting with `$` are never matched by a
/// filter whose first level is a wildcard.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');

    for filter_level in filter.split('/') {
        if filter_level == "#" {
            return true;
        }

        match topic_levels.next() {
            Some(_) if filter_level == "+" => {}
            Some(level) if level == filter_level => {}
            _ => return false,
        }
    }

    topic_levels.next().is_none()
}

/// Returns true if the filter contains a wildcard level
pub fn has_wildcards(filter: &str) -> bool {
    filter.split('/').any(|level| level == "+" || level == "#")
}
