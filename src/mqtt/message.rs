use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec;

/// Delivery guarantee requested for a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityOfService {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl From<QualityOfService> for rumqttc::QoS {
    fn from(qos: QualityOfService) -> Self {
        match qos {
            QualityOfService::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QualityOfService::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QualityOfService::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// One outgoing publish; built per row and consumed by the publish call
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QualityOfService,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>, qos: QualityOfService) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos,
        }
    }

    pub fn preview(&self, max_chars: usize) -> String {
        codec::preview(&self.payload, max_chars)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Message")
            .field("topic", &self.topic)
            .field("payload", &self.preview(40))
            .field("qos", &self.qos)
            .finish()
    }
}
