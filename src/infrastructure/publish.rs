//! Publication boundary
//!
//! Angle observations and position fixes leave the gateway as topic/payload
//! pairs. Topics embed the locator (or aggregator) id and the tag id at fixed
//! positions; payloads are `key=value` fields separated by `;`.

use crate::domain::models::{AngleObservation, DeviceId, Position, PositionResult};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::mpsc;

const ANGLE_TOPIC_PREFIX: &str = "locator";
const ANGLE_TOPIC_SUFFIX: &str = "angle";
const POSITION_TOPIC_PREFIX: &str = "multilocator";
const POSITION_TOPIC_SUFFIX: &str = "position";
const TAG_SEGMENT: &str = "tag";

#[derive(Debug, Error, PartialEq)]
pub enum PublishError {
    #[error("topic does not match the expected template: {0}")]
    Topic(String),
    #[error("payload field {0} missing")]
    MissingField(&'static str),
    #[error("payload field {field} has invalid value {value:?}")]
    InvalidValue { field: &'static str, value: String },
    #[error("publication channel closed")]
    ChannelClosed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub topic: String,
    pub payload: String,
}

impl fmt::Display for Publication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.topic, self.payload)
    }
}

pub fn format_angle_topic(locator_id: &DeviceId, tag_id: &DeviceId) -> String {
    format!(
        "{}/{}/{}/{}/{}",
        ANGLE_TOPIC_PREFIX, locator_id, TAG_SEGMENT, tag_id, ANGLE_TOPIC_SUFFIX
    )
}

pub fn format_position_topic(aggregator_id: &DeviceId, tag_id: &DeviceId) -> String {
    format!(
        "{}/{}/{}/{}/{}",
        POSITION_TOPIC_PREFIX, aggregator_id, TAG_SEGMENT, tag_id, POSITION_TOPIC_SUFFIX
    )
}

fn scan_topic(topic: &str, prefix: &str, suffix: &str) -> Option<(DeviceId, DeviceId)> {
    let mut parts = topic.split('/');
    let (Some(p), Some(first), Some(t), Some(second), Some(s), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return None;
    };
    if p != prefix || t != TAG_SEGMENT || s != suffix || first.is_empty() || second.is_empty() {
        return None;
    }
    Some((DeviceId::from(first), DeviceId::from(second)))
}

/// Extract `(locator_id, tag_id)` from an angle topic
pub fn scan_angle_topic(topic: &str) -> Option<(DeviceId, DeviceId)> {
    scan_topic(topic, ANGLE_TOPIC_PREFIX, ANGLE_TOPIC_SUFFIX)
}

/// Extract `(aggregator_id, tag_id)` from a position topic
pub fn scan_position_topic(topic: &str) -> Option<(DeviceId, DeviceId)> {
    scan_topic(topic, POSITION_TOPIC_PREFIX, POSITION_TOPIC_SUFFIX)
}

pub fn encode_angle(observation: &AngleObservation) -> String {
    format!(
        "azimuth={};elevation={};distance={};rssi={};channel={};sequence={}",
        observation.azimuth,
        observation.elevation,
        observation.distance,
        observation.rssi,
        observation.channel,
        observation.sequence
    )
}

pub fn encode_position(position: &Position) -> String {
    format!("x={};y={};z={}", position.x, position.y, position.z)
}

struct Fields<'a>(HashMap<&'a str, &'a str>);

impl<'a> Fields<'a> {
    fn parse(payload: &'a str) -> Self {
        Self(
            payload
                .split(';')
                .filter_map(|field| field.split_once('='))
                .map(|(k, v)| (k.trim(), v.trim()))
                .collect(),
        )
    }

    fn get<T: FromStr>(&self, field: &'static str) -> Result<T, PublishError> {
        let value = self.0.get(field).ok_or(PublishError::MissingField(field))?;
        value.parse().map_err(|_| PublishError::InvalidValue {
            field,
            value: value.to_string(),
        })
    }
}

/// Rebuild an angle observation from a topic/payload pair
pub fn decode_angle(topic: &str, payload: &str) -> Result<AngleObservation, PublishError> {
    let (locator_id, tag_id) =
        scan_angle_topic(topic).ok_or_else(|| PublishError::Topic(topic.to_string()))?;
    let fields = Fields::parse(payload);
    Ok(AngleObservation {
        tag_id,
        locator_id,
        azimuth: fields.get("azimuth")?,
        elevation: fields.get("elevation")?,
        distance: fields.get("distance")?,
        rssi: fields.get("rssi")?,
        channel: fields.get("channel")?,
        sequence: fields.get("sequence")?,
    })
}

pub fn decode_position(topic: &str, payload: &str) -> Result<PositionResult, PublishError> {
    let (_, tag_id) =
        scan_position_topic(topic).ok_or_else(|| PublishError::Topic(topic.to_string()))?;
    let fields = Fields::parse(payload);
    Ok(PositionResult {
        tag_id,
        position: Position {
            x: fields.get("x")?,
            y: fields.get("y")?,
            z: fields.get("z")?,
        },
    })
}

/// Sole writer to the publish/subscribe transport
#[derive(Debug, Clone)]
pub struct Publisher {
    sender: mpsc::UnboundedSender<Publication>,
}

impl Publisher {
    pub fn new(sender: mpsc::UnboundedSender<Publication>) -> Self {
        Self { sender }
    }

    fn send(&self, publication: Publication) -> Result<Publication, PublishError> {
        self.sender
            .send(publication.clone())
            .map_err(|_| PublishError::ChannelClosed)?;
        Ok(publication)
    }

    /// Returns the publication that was sent
    pub fn publish_angle(&self, observation: &AngleObservation) -> Result<Publication, PublishError> {
        self.send(Publication {
            topic: format_angle_topic(&observation.locator_id, &observation.tag_id),
            payload: encode_angle(observation),
        })
    }

    pub fn publish_position(
        &self,
        aggregator_id: &DeviceId,
        result: &PositionResult,
    ) -> Result<Publication, PublishError> {
        self.send(Publication {
            topic: format_position_topic(aggregator_id, &result.tag_id),
            payload: encode_position(&result.position),
        })
    }
}
