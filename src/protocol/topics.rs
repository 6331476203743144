//! MQTT topic filter validation and wildcard matching
//!
//! Filters may contain `+` (exactly one level) and `#` (all remaining levels,
//! last level only). Topic names used for publishing may contain neither.

use thiserror::Error;

/// Maximum encoded length of a topic in MQTT
const MAX_TOPIC_LEN: usize = 65_535;

/// Validate a subscription topic filter such as `owntracks/+/#`
pub fn validate_topic_filter(filter: &str) -> Result<(), ValidationError> {
    check_common(filter)?;

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || index != last) {
            return Err(ValidationError::MisplacedMultiLevelWildcard(
                filter.to_string(),
            ));
        }
        if level.contains('+') && *level != "+" {
            return Err(ValidationError::MisplacedSingleLevelWildcard(
                filter.to_string(),
            ));
        }
    }

    Ok(())
}

/// Validate a concrete topic name used for publishing
pub fn validate_topic_name(topic: &str) -> Result<(), ValidationError> {
    check_common(topic)?;

    if topic.contains(['+', '#']) {
        return Err(ValidationError::WildcardInTopicName(topic.to_string()));
    }

    Ok(())
}

fn check_common(topic: &str) -> Result<(), ValidationError> {
    if topic.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(ValidationError::TopicTooLong(topic.len()));
    }
    if topic.contains('\0') {
        return Err(ValidationError::NullCharacter);
    }
    Ok(())
}

/// Whether a concrete topic matches a (valid) topic filter
///
/// Topics starting with `$` are not matched by a leading wildcard.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(expected), Some(actual)) if expected == actual => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Topic validation errors
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Topic cannot be empty")]
    EmptyTopic,
    #[error("Topic is {0} bytes, longer than the MQTT limit of 65535")]
    TopicTooLong(usize),
    #[error("Topic contains a null character")]
    NullCharacter,
    #[error("'#' must be the whole last level of the filter: {0}")]
    MisplacedMultiLevelWildcard(String),
    #[error("'+' must occupy a whole level of the filter: {0}")]
    MisplacedSingleLevelWildcard(String),
    #[error("Wildcards are not allowed when publishing: {0}")]
    WildcardInTopicName(String),
}
