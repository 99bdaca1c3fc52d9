//! Command Tags
//!
//! The first byte of every datagram and every transfer frame.

use std::fmt;

use crate::error::{Error, Result};

/// Protocol command carried in the tag byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Join request, broadcast by a starting node
    Start = 0,
    /// Leader's answer to START
    StartAck = 1,
    /// Heartbeat to the leader
    Health = 2,
    /// Leader's answer to HEALTH
    HealthAck = 3,
    /// Ring election token or announcement
    Election = 4,
    /// New leader announcement
    LeaderInfo = 5,
    /// Neighbour assignment from the leader
    Neighbour = 6,
    /// File upload over the reliable channel
    FileUpload = 16,
    /// Upload acknowledgement
    FileUploadAck = 17,
}

impl Command {
    /// Every command, in tag order
    pub const ALL: [Command; 9] = [
        Command::Start,
        Command::StartAck,
        Command::Health,
        Command::HealthAck,
        Command::Election,
        Command::LeaderInfo,
        Command::Neighbour,
        Command::FileUpload,
        Command::FileUploadAck,
    ];

    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Look up the command for a tag byte
    pub fn from_tag(tag: u8) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|command| command.tag() == tag)
            .ok_or(Error::UnknownCommand(tag))
    }

    /// Name used in logs
    pub fn name(self) -> &'static str {
        match self {
            Command::Start => "START",
            Command::StartAck => "START_ACK",
            Command::Health => "HEALTH",
            Command::HealthAck => "HEALTH_ACK",
            Command::Election => "ELECTION",
            Command::LeaderInfo => "LEADER_INFO",
            Command::Neighbour => "NEIGHBOUR",
            Command::FileUpload => "FILE_UPLOAD",
            Command::FileUploadAck => "FILE_UPLOAD_ACK",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_stable() {
        assert_eq!(Command::Start.tag(), 0);
        assert_eq!(Command::LeaderInfo.tag(), 5);
        assert_eq!(Command::FileUploadAck.tag(), 17);

        for command in Command::ALL {
            assert_eq!(Command::from_tag(command.tag()).unwrap(), command);
        }
    }

    #[test]
    fn test_unknown_tag() {
        assert!(matches!(Command::from_tag(7), Err(Error::UnknownCommand(7))));
        assert!(matches!(Command::from_tag(255), Err(Error::UnknownCommand(255))));
    }
}
