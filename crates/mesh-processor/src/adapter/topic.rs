//! Gateway topic parsing
//!
//! Gateway topics look like `msh/{region...}/2/{kind}/{channel}/{user}` where
//! the region part has zero to four segments. Fields are read at fixed
//! offsets from the protocol version segment.

/// Protocol version segment
const VERSION_SEGMENT: &str = "2";

/// Frames on topics shorter than this are dropped
const MIN_SEGMENTS: usize = 3;

/// Packet kind of gateway statistics frames
pub const KIND_STAT: &str = "stat";

/// Packet kind of text-encoded JSON frames
pub const KIND_JSON: &str = "json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicParts {
    pub full: String,
    pub packet_kind: String,
    pub channel: Option<String>,
    pub user: Option<String>,
}

/// Split a gateway topic, `None` when it does not have the expected shape
pub fn parse_topic(topic: &str) -> Option<TopicParts> {
    let segments: Vec<&str> = topic.split('/').collect();
    if segments.len() < MIN_SEGMENTS {
        return None;
    }

    // The root prefix is never the version segment
    let version = segments
        .iter()
        .skip(1)
        .position(|segment| *segment == VERSION_SEGMENT)?
        + 1;

    let segment = |offset: usize| {
        segments
            .get(version + offset)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    };

    Some(TopicParts {
        full: topic.to_string(),
        packet_kind: segment(1)?,
        channel: segment(2),
        user: segment(3),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_encrypted_topic() {
        let parts = parse_topic("msh/msk/2/e/LongFast/!088aa170").unwrap();
        assert_eq!(parts.packet_kind, "e");
        assert_eq!(parts.channel.as_deref(), Some("LongFast"));
        assert_eq!(parts.user.as_deref(), Some("!088aa170"));
        assert_eq!(parts.full, "msh/msk/2/e/LongFast/!088aa170");
    }

    #[test]
    fn test_parse_nested_region() {
        let parts = parse_topic("msh/RU/msk/city/2/json/LongFast/!088aa170").unwrap();
        assert_eq!(parts.packet_kind, "json");
        assert_eq!(parts.channel.as_deref(), Some("LongFast"));
    }

    #[test]
    fn test_parse_map_report() {
        let parts = parse_topic("msh/msk/2/map/").unwrap();
        assert_eq!(parts.packet_kind, "map");
        assert_eq!(parts.channel, None);
        assert_eq!(parts.user, None);
    }

    #[test]
    fn test_short_or_unversioned_topics_dropped() {
        assert!(parse_topic("msh/msk").is_none());
        assert!(parse_topic("msh").is_none());
        assert!(parse_topic("msh/msk/e/LongFast").is_none());
        assert!(parse_topic("msh/msk/2").is_none());
    }

    #[test]
    fn test_stat_kind_is_parsed() {
        let parts = parse_topic("msh/msk/2/stat/!088aa170").unwrap();
        assert_eq!(parts.packet_kind, KIND_STAT);
    }
}
