use serde::Deserialize;

use castcore_protocol::ring::RingBufferConfig;

/// Connection-tunable defaults, loadable from an optional TOML file.
/// CLI flags always take precedence over a loaded value.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Ring buffer capacity (frame slots) for the video stream.
    #[serde(default = "default_video_ring_capacity")]
    pub video_ring_capacity: usize,

    /// Ring buffer capacity (frame slots) for the message stream.
    #[serde(default = "default_message_ring_capacity")]
    pub message_ring_capacity: usize,

    /// Starting point for the congestion controller before the first
    /// window closes.
    #[serde(default = "default_initial_bitrate_kbps")]
    pub initial_bitrate_kbps: u32,

    /// Fragment payload size handed to the fragmenter; capped at
    /// `castcore_protocol::MAX_PAYLOAD`.
    #[serde(default = "default_fragment_size")]
    pub fragment_size: usize,

    /// `cpal` output device name; `None` selects the host default.
    #[serde(default)]
    pub output_device: Option<String>,

    /// Initial render surface size, used to size the first `Dimensions`
    /// message and as the baseline for the resize-coalescing policy.
    #[serde(default = "default_output_width")]
    pub output_width: u32,
    #[serde(default = "default_output_height")]
    pub output_height: u32,

    /// STUN server used to discover this host's public endpoint before
    /// connecting, e.g. `"stun.l.google.com:19302"`. `None` skips STUN
    /// and dials the server directly.
    #[serde(default)]
    pub stun_server: Option<String>,
}

fn default_video_ring_capacity() -> usize {
    256
}

fn default_message_ring_capacity() -> usize {
    64
}

fn default_initial_bitrate_kbps() -> u32 {
    4_000
}

fn default_fragment_size() -> usize {
    castcore_protocol::MAX_PAYLOAD
}

fn default_output_width() -> u32 {
    1280
}

fn default_output_height() -> u32 {
    720
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            video_ring_capacity: default_video_ring_capacity(),
            message_ring_capacity: default_message_ring_capacity(),
            initial_bitrate_kbps: default_initial_bitrate_kbps(),
            fragment_size: default_fragment_size(),
            output_device: None,
            output_width: default_output_width(),
            output_height: default_output_height(),
            stun_server: None,
        }
    }
}

impl ClientConfig {
    pub fn video_ring_config(&self) -> RingBufferConfig {
        RingBufferConfig {
            capacity: self.video_ring_capacity,
            ..RingBufferConfig::default()
        }
    }

    pub fn message_ring_config(&self) -> RingBufferConfig {
        RingBufferConfig {
            capacity: self.message_ring_capacity,
            ..RingBufferConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = ClientConfig::default();
        assert_eq!(config.video_ring_capacity, 256);
        assert_eq!(config.initial_bitrate_kbps, 4_000);
        assert_eq!(config.fragment_size, castcore_protocol::MAX_PAYLOAD);
    }

    #[test]
    fn config_toml_deserialization() {
        let toml = r#"
            video_ring_capacity = 128
            initial_bitrate_kbps = 6000
            output_width = 1920
            output_height = 1080
            stun_server = "stun.example.com:3478"
        "#;
        let config: ClientConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.video_ring_capacity, 128);
        assert_eq!(config.initial_bitrate_kbps, 6_000);
        assert_eq!(config.stun_server.as_deref(), Some("stun.example.com:3478"));
        // Fields left out of the file still pick up their defaults.
        assert_eq!(config.message_ring_capacity, 64);
    }

    #[test]
    fn video_ring_config_carries_capacity_override() {
        let config = ClientConfig {
            video_ring_capacity: 40,
            ..ClientConfig::default()
        };
        assert_eq!(config.video_ring_config().capacity, 40);
    }
}
