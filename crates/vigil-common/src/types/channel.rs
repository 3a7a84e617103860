use crate::error::VigilError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default topic for failures of the capture and parse stages
pub const TOPIC_DEAD_LETTER: &str = "dead-letter";

/// Default topic for canonical records
pub const TOPIC_NORMALIZED: &str = "normalized";

/// Default topic for failures of the normalization stage
pub const TOPIC_NORMALIZED_DLQ: &str = "normalized-dlq";

/// Source system of a communication; selects topics, parser and normalizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    TeamsChat,
    TeamsCalls,
    UnigyTurret,
    BloombergChat,
    BloombergEmail,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::Email,
        Channel::TeamsChat,
        Channel::TeamsCalls,
        Channel::UnigyTurret,
        Channel::BloombergChat,
        Channel::BloombergEmail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::TeamsChat => "teams_chat",
            Channel::TeamsCalls => "teams_calls",
            Channel::UnigyTurret => "unigy_turret",
            Channel::BloombergChat => "bloomberg_chat",
            Channel::BloombergEmail => "bloomberg_email",
        }
    }

    /// Topic carrying this channel's raw envelopes
    pub fn raw_topic(&self) -> String {
        format!("raw-{}", self.as_str())
    }

    /// Topic carrying this channel's parsed records
    pub fn parsed_topic(&self) -> String {
        format!("parsed-{}", self.as_str())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        Channel::ALL
            .into_iter()
            .find(|channel| channel.as_str() == wanted)
            .ok_or_else(|| VigilError::UnknownChannel(s.to_string()))
    }
}
