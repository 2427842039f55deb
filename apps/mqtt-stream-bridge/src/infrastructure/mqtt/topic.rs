//! Topic filter matching with MQTT `+` and `#` wildcards.

const SHARED_PREFIX: &str = "$share/";

/// Whether a PUBLISH on `topic` is delivered to a subscription on `filter`.
///
/// `+` matches exactly one level, a trailing `#` matches the parent level and
/// everything below it. Wildcards at the first level never match topics
/// starting with `$`. Shared subscriptions (`$share/<group>/<filter>`) match
/// on their inner filter.
#[must_use]
pub fn matches(filter: &str, topic: &str) -> bool {
    let filter = strip_shared(filter);

    if filter == topic {
        return true;
    }
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    for level in filter.split('/') {
        match level {
            "#" => return true,
            "+" => {
                if topic_levels.next().is_none() {
                    return false;
                }
            }
            exact => {
                if topic_levels.next() != Some(exact) {
                    return false;
                }
            }
        }
    }
    topic_levels.next().is_none()
}

fn strip_shared(filter: &str) -> &str {
    filter
        .strip_prefix(SHARED_PREFIX)
        .and_then(|rest| rest.split_once('/'))
        .map_or(filter, |(_, inner)| inner)
}
