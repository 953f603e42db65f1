//! Topic name and filter validation
//!
//! Key rules:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Topic filters MAY contain wildcards
//! - Multi-level wildcard (#) must be the last level and occupy it entirely
//! - Single-level wildcard (+) must occupy an entire level
//! - Topics starting with $ are system topics and have special matching rules

use crate::protocol::ProtocolError;

/// Represents a level in a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicLevel<'a> {
    /// Normal topic level
    Normal(&'a str),
    /// Single-level wildcard (+)
    SingleWildcard,
    /// Multi-level wildcard (#)
    MultiWildcard,
}

/// Parse topic into levels
pub fn parse_levels(topic: &str) -> impl Iterator<Item = TopicLevel<'_>> {
    topic.split('/').map(|level| match level {
        "+" => TopicLevel::SingleWildcard,
        "#" => TopicLevel::MultiWildcard,
        s => TopicLevel::Normal(s),
    })
}

/// Whether a topic is a `$`-topic that wildcards at the first level skip
#[inline]
pub fn is_system_topic(topic: &str) -> bool {
    topic.starts_with('$')
}

/// Validate a topic name (used in PUBLISH)
pub fn validate_topic_name(topic: &str) -> Result<(), ProtocolError> {
    validate_topic_name_with_max_levels(topic, 0)
}

/// Validate a topic name with configurable max levels
///
/// Topic names:
/// - Must be at least 1 character
/// - Must not exceed 65535 bytes
/// - Must not contain null character
/// - Must not contain wildcards (+ or #)
/// - Must not exceed max_topic_levels if set (0 = unlimited)
pub fn validate_topic_name_with_max_levels(
    topic: &str,
    max_topic_levels: usize,
) -> Result<(), ProtocolError> {
    if topic.is_empty() {
        return Err(ProtocolError::InvalidTopicName("topic name cannot be empty"));
    }

    if topic.len() > 65535 {
        return Err(ProtocolError::InvalidTopicName(
            "topic name exceeds maximum length",
        ));
    }

    if topic.contains('\0') {
        return Err(ProtocolError::InvalidTopicName(
            "topic name cannot contain null character",
        ));
    }

    if topic.contains('+') || topic.contains('#') {
        return Err(ProtocolError::InvalidTopicName(
            "topic name cannot contain wildcards",
        ));
    }

    if max_topic_levels > 0 && topic.split('/').count() > max_topic_levels {
        return Err(ProtocolError::InvalidTopicName(
            "topic exceeds maximum allowed levels",
        ));
    }

    Ok(())
}

/// Validate a topic filter (used in SUBSCRIBE/UNSUBSCRIBE)
pub fn validate_topic_filter(filter: &str) -> Result<(), ProtocolError> {
    validate_topic_filter_with_max_levels(filter, 0)
}

/// Validate a topic filter with configurable max levels
///
/// Topic filters:
/// - Must be at least 1 character
/// - Must not exceed 65535 bytes
/// - Must not contain null character
/// - Multi-level wildcard (#) must be the only character of the last level
/// - Single-level wildcard (+) must occupy an entire level
/// - Must not exceed max_topic_levels if set (0 = unlimited)
pub fn validate_topic_filter_with_max_levels(
    filter: &str,
    max_topic_levels: usize,
) -> Result<(), ProtocolError> {
    if filter.is_empty() {
        return Err(ProtocolError::MalformedFilter("topic filter cannot be empty"));
    }

    if filter.len() > 65535 {
        return Err(ProtocolError::MalformedFilter(
            "topic filter exceeds maximum length",
        ));
    }

    if filter.contains('\0') {
        return Err(ProtocolError::MalformedFilter(
            "topic filter cannot contain null character",
        ));
    }

    let mut count = 0;
    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        count += 1;

        if level.contains('#') {
            if level != "#" {
                return Err(ProtocolError::MalformedFilter(
                    "multi-level wildcard must occupy entire level",
                ));
            }
            if levels.peek().is_some() {
                return Err(ProtocolError::MalformedFilter(
                    "multi-level wildcard must be last level",
                ));
            }
        }

        if level.contains('+') && level != "+" {
            return Err(ProtocolError::MalformedFilter(
                "single-level wildcard must occupy entire level",
            ));
        }
    }

    if max_topic_levels > 0 && count > max_topic_levels {
        return Err(ProtocolError::MalformedFilter(
            "topic filter exceeds maximum allowed levels",
        ));
    }

    Ok(())
}

/// Check if a topic filter matches a topic name
///
/// Straight-line reference matcher, used for single checks and to
/// cross-check the trie.
///
/// Matching rules:
/// - / is the level separator
/// - + matches exactly one level
/// - # matches zero or more levels (must be last)
/// - $-topics don't match filters starting with + or #
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if is_system_topic(topic) && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    for filter_level in parse_levels(filter) {
        match filter_level {
            TopicLevel::MultiWildcard => return true,
            TopicLevel::SingleWildcard => {
                if topic_levels.next().is_none() {
                    return false;
                }
            }
            TopicLevel::Normal(expected) => {
                if topic_levels.next() != Some(expected) {
                    return false;
                }
            }
        }
    }

    topic_levels.next().is_none()
}
