//! Device playback sink.
//!
//! Generalized from a fixed Opus/48kHz assumption to a sink that exposes
//! [`DeviceSink::submit`]/[`DeviceSink::queued_bytes`] against whatever
//! sample rate the server announces, and that can be destroyed and
//! recreated without the caller losing decoded-but-unplayed audio.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::HeapRb;
use tracing::{error, info};

use castcore_protocol::CoreError;

use crate::device;

/// One second of f32 samples at the stream's rate; comfortably above the
/// `UPPER` playout watermark so the flush logic, not
/// the ring buffer, is what drops audio under sustained backlog.
fn ring_capacity(sample_rate_hz: u32) -> usize {
    sample_rate_hz as usize
}

/// Destination for decoded PCM samples. A trait so the playout state
/// machine can be exercised in tests without an actual audio device.
pub trait DeviceSink: Send {
    fn sample_rate_hz(&self) -> u32;

    /// Bytes of PCM still sitting in the device queue, awaiting playback.
    fn queued_bytes(&self) -> usize;

    /// Enqueue decoded samples for playback.
    fn submit(&mut self, pcm: &[f32]);

    /// Destroy and recreate the underlying device stream at a new sample
    /// rate, without the caller needing to know how that's done.
    fn reopen(&mut self, sample_rate_hz: u32) -> Result<(), CoreError>;
}

/// A `DeviceSink` backed by a live cpal output stream.
pub struct CpalSink {
    #[allow(dead_code)] // held only to keep the stream alive
    stream: cpal::Stream,
    producer: ringbuf::HeapProd<f32>,
    sample_rate_hz: u32,
    device_name: Option<String>,
}

// SAFETY: CpalSink only holds the cpal::Stream handle to keep it alive and
// never calls methods on it from multiple threads; the `!Send`/`!Sync`
// markers on cpal::Stream are conservative for this hold-only use.
unsafe impl Send for CpalSink {}
unsafe impl Sync for CpalSink {}

impl CpalSink {
    pub fn open(device_name: Option<&str>, sample_rate_hz: u32) -> Result<Self, CoreError> {
        let dev = device::get_output_device(device_name)
            .map_err(|e| CoreError::Fatal(format!("no output device: {e}")))?;
        let config = dev
            .default_output_config()
            .map_err(|e| CoreError::Fatal(format!("output device has no config: {e}")))?;
        let channels = config.channels() as usize;

        let (stream_config, actual_rate) = negotiate_rate(&dev, &config, sample_rate_hz);

        info!(
            device = dev.name().unwrap_or_default(),
            sample_rate = actual_rate,
            channels,
            "opening audio output sink"
        );

        let rb = HeapRb::<f32>::new(ring_capacity(actual_rate));
        let (producer, mut consumer) = rb.split();

        let stream = match config.sample_format() {
            SampleFormat::F32 => dev
                .build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        fill_with_fadeout(data, channels, &mut consumer);
                    },
                    move |err| error!("audio playback error: {err}"),
                    None,
                )
                .map_err(|e| CoreError::Fatal(format!("failed to build output stream: {e}")))?,
            other => {
                return Err(CoreError::Fatal(format!(
                    "unsupported output sample format: {other:?}"
                )))
            }
        };

        stream
            .play()
            .map_err(|e| CoreError::Fatal(format!("failed to start output stream: {e}")))?;

        Ok(Self {
            stream,
            producer,
            sample_rate_hz: actual_rate,
            device_name: device_name.map(String::from),
        })
    }

    /// Tear down and recreate the device stream, e.g. after the server's
    /// announced sample rate changes. Any samples queued on the old stream
    /// are lost; callers should drain/resubmit via the playout state
    /// machine rather than holding samples across this call.
    pub fn reopen(&mut self, sample_rate_hz: u32) -> Result<(), CoreError> {
        let replacement = Self::open(self.device_name.as_deref(), sample_rate_hz)?;
        *self = replacement;
        Ok(())
    }
}

impl DeviceSink for CpalSink {
    fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }

    fn queued_bytes(&self) -> usize {
        self.producer.occupied_len() * std::mem::size_of::<f32>()
    }

    fn submit(&mut self, pcm: &[f32]) {
        let _ = self.producer.push_slice(pcm);
    }

    fn reopen(&mut self, sample_rate_hz: u32) -> Result<(), CoreError> {
        CpalSink::reopen(self, sample_rate_hz)
    }
}

fn negotiate_rate(
    dev: &cpal::Device,
    config: &cpal::SupportedStreamConfig,
    target_rate: u32,
) -> (StreamConfig, u32) {
    let fallback_rate = config.sample_rate().0;
    if fallback_rate == target_rate {
        return (
            StreamConfig {
                channels: config.channels(),
                sample_rate: cpal::SampleRate(target_rate),
                buffer_size: cpal::BufferSize::Default,
            },
            target_rate,
        );
    }

    let test = StreamConfig {
        channels: config.channels(),
        sample_rate: cpal::SampleRate(target_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    match dev.build_output_stream(
        &test,
        |_: &mut [f32], _: &cpal::OutputCallbackInfo| {},
        |_| {},
        None,
    ) {
        Ok(_dropped) => (test, target_rate),
        Err(_) => (
            StreamConfig {
                channels: config.channels(),
                sample_rate: config.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            },
            fallback_rate,
        ),
    }
}

fn fill_with_fadeout(data: &mut [f32], channels: usize, consumer: &mut ringbuf::HeapCons<f32>) {
    if channels == 1 {
        let read = consumer.pop_slice(data);
        if read < data.len() && read > 0 {
            let fade_len = read.min(32);
            let fade_start = read - fade_len;
            for i in 0..fade_len {
                data[fade_start + i] *= 1.0 - (i as f32 / fade_len as f32);
            }
        }
        for sample in &mut data[read..] {
            *sample = 0.0;
        }
        return;
    }

    let mono_frames = data.len() / channels;
    let mut last_sample = 0.0f32;
    let mut underrun_at = mono_frames;

    for (i, frame) in data.chunks_mut(channels).enumerate() {
        let sample = match consumer.try_pop() {
            Some(s) => {
                last_sample = s;
                s
            }
            None => {
                if underrun_at == mono_frames {
                    underrun_at = i;
                }
                let fade_i = i - underrun_at;
                if fade_i < 32 {
                    last_sample * (1.0 - fade_i as f32 / 32.0)
                } else {
                    0.0
                }
            }
        };
        for ch in frame.iter_mut() {
            *ch = sample;
        }
    }
}
