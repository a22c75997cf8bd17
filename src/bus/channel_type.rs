use serde::{Deserialize, Serialize};

/// Inbound platform a conversation arrives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Facebook,
    Instagram,
    WhatsApp,
    Web,
}

impl ChannelType {
    pub const ALL: [ChannelType; 4] = [
        ChannelType::Facebook,
        ChannelType::Instagram,
        ChannelType::WhatsApp,
        ChannelType::Web,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Facebook => "facebook",
            ChannelType::Instagram => "instagram",
            ChannelType::WhatsApp => "whatsapp",
            ChannelType::Web => "web",
        }
    }
}

impl std::str::FromStr for ChannelType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "facebook" => Ok(ChannelType::Facebook),
            "instagram" => Ok(ChannelType::Instagram),
            "whatsapp" => Ok(ChannelType::WhatsApp),
            "web" => Ok(ChannelType::Web),
            _ => Err(format!("Unknown channel type: {}", s)),
        }
    }
}

impl From<ChannelType> for String {
    fn from(channel: ChannelType) -> Self {
        channel.as_str().to_string()
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests;
