//! Channel description: the read-only snapshot of PIDs and track metadata
//! a recording is made from.

use serde::{Deserialize, Serialize};

/// An audio (or AC-3) elementary stream with its ISO-639 language code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioTrack {
    pub pid: u16,
    /// Three-letter ISO-639 code, e.g. "deu".
    pub lang: String,
}

/// A DVB-subtitle elementary stream with its language code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtitleTrack {
    pub pid: u16,
    pub lang: String,
}

/// One teletext page announcement: language plus type/magazine/page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeletextPage {
    pub lang: String,
    pub teletext_type: u8,
    pub magazine: u8,
    pub page: u8,
}

/// Everything the PAT/PMT codec and the recorder need to know about a
/// channel. Frozen at recorder construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    /// Video PID, 0 for radio channels.
    #[serde(default)]
    pub vpid: u16,
    /// Video stream type (0x01 MPEG-1, 0x02 MPEG-2, 0x1B H.264).
    #[serde(default)]
    pub vtype: u8,
    /// PCR PID; 0 means the video PID carries the clock.
    #[serde(default)]
    pub ppid: u16,
    #[serde(default)]
    pub apids: Vec<AudioTrack>,
    /// AC-3 streams.
    #[serde(default)]
    pub dpids: Vec<AudioTrack>,
    #[serde(default)]
    pub spids: Vec<SubtitleTrack>,
    /// Teletext PID, 0 if absent.
    #[serde(default)]
    pub tpid: u16,
    #[serde(default)]
    pub teletext_pages: Vec<TeletextPage>,
}

impl ChannelDescriptor {
    /// The PID and stream type the frame detector should lock onto:
    /// video if present, else the first audio, else the first AC-3 track.
    pub fn detector_target(&self) -> Option<(u16, u8)> {
        if self.vpid != 0 {
            Some((self.vpid, self.vtype))
        } else if let Some(a) = self.apids.first() {
            Some((a.pid, 0x04))
        } else {
            self.dpids.first().map(|d| (d.pid, 0x06))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detector_target_prefers_video() {
        let mut ch = ChannelDescriptor { vpid: 100, vtype: 2, ..Default::default() };
        ch.apids.push(AudioTrack { pid: 101, lang: "deu".into() });
        assert_eq!(ch.detector_target(), Some((100, 2)));

        ch.vpid = 0;
        assert_eq!(ch.detector_target(), Some((101, 0x04)));

        ch.apids.clear();
        ch.dpids.push(AudioTrack { pid: 102, lang: "deu".into() });
        assert_eq!(ch.detector_target(), Some((102, 0x06)));

        ch.dpids.clear();
        assert_eq!(ch.detector_target(), None);
    }

    #[test]
    fn deserializes_partial_json() {
        let ch: ChannelDescriptor = serde_json::from_str(
            r#"{"vpid":100,"vtype":2,"apids":[{"pid":101,"lang":"deu"}]}"#,
        )
        .unwrap();
        assert_eq!(ch.vpid, 100);
        assert_eq!(ch.apids.len(), 1);
        assert!(ch.spids.is_empty());
        assert_eq!(ch.tpid, 0);
    }
}
