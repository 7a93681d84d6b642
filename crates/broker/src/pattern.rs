//! Topic names and subscription patterns.
//!
//! Topics are dot-separated segments (`agents.search.results`). Patterns
//! may use `*` for exactly one segment and a trailing `#` (or `**`) for
//! any number of remaining segments, including none.
//!
//! The message kind and the addressee both live in the topic. The usual
//! layout is `<kind>.<recipient>[.<detail>]`, e.g. `agent_result.planner`
//! or `trust_update.all`, so `agent_result.planner.#` is a direct inbox and
//! `agent_heartbeat.*` follows one kind for every agent.

use crate::error::{BrokerError, BrokerResult};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    AnyOne,
    AnyTail,
}

/// Compiled subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> BrokerResult<Self> {
        let invalid = |reason: &str| BrokerError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        if pattern.is_empty() {
            return Err(invalid("pattern is empty"));
        }

        let parts: Vec<&str> = pattern.split('.').collect();
        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let segment = match *part {
                "" => return Err(invalid("empty segment")),
                "*" => Segment::AnyOne,
                "#" | "**" if i + 1 == parts.len() => Segment::AnyTail,
                "#" | "**" => return Err(invalid("multi-segment wildcard must be last")),
                literal if literal.contains(['*', '#']) => {
                    return Err(invalid("wildcards must span a whole segment"))
                }
                literal => Segment::Literal(literal.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, topic: &str) -> bool {
        let mut parts = topic.split('.');
        for segment in &self.segments {
            match segment {
                Segment::AnyTail => return true,
                Segment::AnyOne => {
                    if parts.next().is_none() {
                        return false;
                    }
                }
                Segment::Literal(expected) => match parts.next() {
                    Some(part) if part == expected => {}
                    _ => return false,
                },
            }
        }
        parts.next().is_none()
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Check a concrete topic name used for publishing.
pub fn validate_topic(topic: &str) -> BrokerResult<()> {
    if topic.is_empty() {
        return Err(BrokerError::Validation("topic is empty".to_string()));
    }
    if topic.len() > 256 {
        return Err(BrokerError::Validation("topic longer than 256 bytes".to_string()));
    }
    for part in topic.split('.') {
        if part.is_empty() {
            return Err(BrokerError::Validation(format!(
                "topic '{}' has an empty segment",
                topic
            )));
        }
        if part.contains(['*', '#']) {
            return Err(BrokerError::Validation(format!(
                "topic '{}' contains a wildcard",
                topic
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, topic: &str) -> bool {
        TopicPattern::parse(pattern).unwrap().matches(topic)
    }

    #[test]
    fn test_literal_match() {
        assert!(matches("agents.status", "agents.status"));
        assert!(!matches("agents.status", "agents.status.extra"));
        assert!(!matches("agents.status", "agents"));
    }

    #[test]
    fn test_single_segment_wildcard() {
        assert!(matches("agents.*.results", "agents.search.results"));
        assert!(!matches("agents.*.results", "agents.results"));
        assert!(!matches("agents.*", "agents.search.results"));
    }

    #[test]
    fn test_tail_wildcard() {
        assert!(matches("agents.#", "agents.search.results"));
        assert!(matches("agents.**", "agents"));
        assert!(matches("#", "anything.at.all"));
        assert!(!matches("agents.#", "tasks.search"));
    }

    #[test]
    fn test_kind_and_recipient_topics() {
        for kind in [
            "trust_update",
            "agent_result",
            "system_alert",
            "agent_heartbeat",
            "schema_update",
        ] {
            assert!(validate_topic(&format!("{}.planner", kind)).is_ok());
        }

        assert!(matches("agent_result.planner.#", "agent_result.planner"));
        assert!(matches("agent_result.planner.#", "agent_result.planner.search"));
        assert!(!matches("agent_result.planner.#", "agent_result.searcher"));

        assert!(matches("agent_heartbeat.*", "agent_heartbeat.searcher"));
        assert!(!matches("agent_heartbeat.*", "agent_result.searcher"));
        assert!(matches("*.planner.#", "system_alert.planner"));
        assert!(matches("*.planner.#", "agent_result.planner.search"));
        assert!(!matches("*.planner.#", "agent_result.searcher"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(TopicPattern::parse("").is_err());
        assert!(TopicPattern::parse("agents..status").is_err());
        assert!(TopicPattern::parse("agents.#.status").is_err());
        assert!(TopicPattern::parse("agents.sta*").is_err());
    }

    #[test]
    fn test_validate_topic() {
        assert!(validate_topic("agents.status").is_ok());
        assert!(validate_topic("").is_err());
        assert!(validate_topic("agents.*").is_err());
        assert!(validate_topic("agents.").is_err());
    }
}
