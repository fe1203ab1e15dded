//! Static media capability tables.
//!
//! Accounts never own codec or plugin descriptors; they hold `&'static`
//! references into these tables, resolved once at decode time.

/// Audio codec descriptor as advertised in SDP (`name/rate/channels`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioCodec {
    pub name: &'static str,
    pub sample_rate: u32,
    pub channels: u8,
    /// Static RTP payload type, `None` for dynamic codecs
    pub payload_type: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoCodec {
    pub name: &'static str,
    pub clock_rate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    MediaNat,
    MediaEncryption,
}

/// A pluggable media strategy (NAT traversal or media encryption).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaPlugin {
    pub id: &'static str,
    pub kind: PluginKind,
    pub description: &'static str,
}

impl std::fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.name, self.sample_rate, self.channels)
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

pub static AUDIO_CODECS: &[AudioCodec] = &[
    AudioCodec {
        name: "opus",
        sample_rate: 48000,
        channels: 2,
        payload_type: None,
    },
    AudioCodec {
        name: "G722",
        sample_rate: 16000,
        channels: 1,
        payload_type: Some(9),
    },
    AudioCodec {
        name: "PCMU",
        sample_rate: 8000,
        channels: 1,
        payload_type: Some(0),
    },
    AudioCodec {
        name: "PCMA",
        sample_rate: 8000,
        channels: 1,
        payload_type: Some(8),
    },
    AudioCodec {
        name: "G726-32",
        sample_rate: 8000,
        channels: 1,
        payload_type: None,
    },
    AudioCodec {
        name: "L16",
        sample_rate: 16000,
        channels: 1,
        payload_type: None,
    },
];

pub static VIDEO_CODECS: &[VideoCodec] = &[
    VideoCodec {
        name: "H264",
        clock_rate: 90000,
    },
    VideoCodec {
        name: "H265",
        clock_rate: 90000,
    },
    VideoCodec {
        name: "VP8",
        clock_rate: 90000,
    },
    VideoCodec {
        name: "VP9",
        clock_rate: 90000,
    },
    VideoCodec {
        name: "AV1",
        clock_rate: 90000,
    },
];

static MEDIA_PLUGINS: &[MediaPlugin] = &[
    MediaPlugin {
        id: "ice",
        kind: PluginKind::MediaNat,
        description: "Interactive Connectivity Establishment",
    },
    MediaPlugin {
        id: "stun",
        kind: PluginKind::MediaNat,
        description: "STUN binding discovery",
    },
    MediaPlugin {
        id: "turn",
        kind: PluginKind::MediaNat,
        description: "TURN relay allocation",
    },
    MediaPlugin {
        id: "srtp",
        kind: PluginKind::MediaEncryption,
        description: "Secure RTP, best effort",
    },
    MediaPlugin {
        id: "srtp-mand",
        kind: PluginKind::MediaEncryption,
        description: "Secure RTP, mandatory",
    },
    MediaPlugin {
        id: "dtls_srtp",
        kind: PluginKind::MediaEncryption,
        description: "DTLS-SRTP keying",
    },
    MediaPlugin {
        id: "zrtp",
        kind: PluginKind::MediaEncryption,
        description: "ZRTP keying",
    },
];

/// Looks up an audio codec. Name comparison is case-insensitive; a zero
/// sample rate or channel count matches any value.
pub fn find_audio_codec(name: &str, sample_rate: u32, channels: u8) -> Option<&'static AudioCodec> {
    AUDIO_CODECS.iter().find(|c| {
        c.name.eq_ignore_ascii_case(name)
            && (sample_rate == 0 || c.sample_rate == sample_rate)
            && (channels == 0 || c.channels == channels)
    })
}

pub fn find_video_codec(name: &str) -> Option<&'static VideoCodec> {
    VIDEO_CODECS.iter().find(|c| c.name.eq_ignore_ascii_case(name))
}

fn find_plugin(kind: PluginKind, id: &str) -> Option<&'static MediaPlugin> {
    MEDIA_PLUGINS
        .iter()
        .find(|p| p.kind == kind && p.id.eq_ignore_ascii_case(id))
}

pub fn find_media_nat(id: &str) -> Option<&'static MediaPlugin> {
    find_plugin(PluginKind::MediaNat, id)
}

pub fn find_media_encryption(id: &str) -> Option<&'static MediaPlugin> {
    find_plugin(PluginKind::MediaEncryption, id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_audio_codec() {
        let opus = find_audio_codec("OPUS", 48000, 2).expect("opus");
        assert_eq!(opus.name, "opus");
        assert!(find_audio_codec("opus", 8000, 1).is_none());
        assert_eq!(find_audio_codec("pcmu", 8000, 1).unwrap().payload_type, Some(0));
        assert!(find_audio_codec("speex", 8000, 1).is_none());
    }

    #[test]
    fn test_find_plugins() {
        assert!(find_media_nat("ICE").is_some());
        assert!(find_media_nat("srtp").is_none());
        assert!(find_media_encryption("srtp-mand").is_some());
        assert!(find_video_codec("vp8").is_some());
    }
}
