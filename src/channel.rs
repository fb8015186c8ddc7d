// src/channel.rs - Logical command sources
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A logical, independently ordered source of codes.
///
/// Every per-channel resource (dispatch queue, upload slot) is indexed by
/// [`Channel::index`], so the set is closed and small.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Channel {
    Http,
    Telnet,
    File,
    Usb,
    Aux,
    Trigger,
    Queue,
    Lcd,
    Sbc,
    Daemon,
    Aux2,
    Autopause,
    File2,
}

impl Channel {
    pub const COUNT: usize = 13;

    pub const ALL: [Channel; Channel::COUNT] = [
        Channel::Http,
        Channel::Telnet,
        Channel::File,
        Channel::Usb,
        Channel::Aux,
        Channel::Trigger,
        Channel::Queue,
        Channel::Lcd,
        Channel::Sbc,
        Channel::Daemon,
        Channel::Aux2,
        Channel::Autopause,
        Channel::File2,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// True for the two channels fed from job files.
    pub fn is_file_feed(self) -> bool {
        matches!(self, Channel::File | Channel::File2)
    }

    /// The job file channel serving the given motion system.
    pub fn for_motion_system(index: usize) -> Option<Channel> {
        match index {
            0 => Some(Channel::File),
            1 => Some(Channel::File2),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Channel::Http => "HTTP",
            Channel::Telnet => "Telnet",
            Channel::File => "File",
            Channel::Usb => "USB",
            Channel::Aux => "Aux",
            Channel::Trigger => "Trigger",
            Channel::Queue => "Queue",
            Channel::Lcd => "LCD",
            Channel::Sbc => "SBC",
            Channel::Daemon => "Daemon",
            Channel::Aux2 => "Aux2",
            Channel::Autopause => "Autopause",
            Channel::File2 => "File2",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .iter()
            .copied()
            .find(|c| c.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown channel '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_are_dense() {
        for (i, channel) in Channel::ALL.iter().enumerate() {
            assert_eq!(channel.index(), i);
        }
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("http".parse::<Channel>().unwrap(), Channel::Http);
        assert_eq!("FILE2".parse::<Channel>().unwrap(), Channel::File2);
        assert!("serial0".parse::<Channel>().is_err());
    }

    #[test]
    fn motion_systems_map_to_file_feeds() {
        assert_eq!(Channel::for_motion_system(0), Some(Channel::File));
        assert_eq!(Channel::for_motion_system(1), Some(Channel::File2));
        assert_eq!(Channel::for_motion_system(2), None);
    }
}
