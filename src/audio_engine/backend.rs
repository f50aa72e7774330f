//! Audio Backend Module
//!
//! Backends drive the engine: they negotiate an output format, call
//! [`Engine::postinit`] once, then call [`Engine::mix`] once per period.
//!
//! - [`CpalBackend`] plays through the default output device.
//! - [`NullBackend`] mixes on a plain thread without any device.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Stream, StreamConfig};
use env_logger::{Builder, Env};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio_engine::Engine;
use crate::audio_engine::errors::{MixerError, Result};

/// Setup and configure the logger for audio operations
pub fn setup_logger() {
    // Default to `info`; override via `RUST_LOG`, e.g. `RUST_LOG=debug`.
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .try_init()
        .unwrap_or(()); // Ignore initialization errors
}

/// Requested output format. `None` fields use the device default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendConfig {
    pub sample_rate: Option<u32>,
    /// Frames per period.
    pub buffer_size: usize,
    pub channels: Option<usize>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            sample_rate: None,
            buffer_size: 512,
            channels: None,
        }
    }
}

/// Something that periodically pulls audio out of an [`Engine`].
pub trait AudioBackend: Sized {
    /// Opens the output, initializes `engine` for it and starts mixing.
    fn start(engine: Arc<Engine>, config: BackendConfig) -> Result<Self>;

    fn name(&self) -> &'static str;
}

/// Output through the default `cpal` device.
pub struct CpalBackend {
    stream: Stream,
}

impl AudioBackend for CpalBackend {
    fn start(engine: Arc<Engine>, config: BackendConfig) -> Result<Self> {
        setup_logger();

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(MixerError::NoAudioDevice)?;

        let default_config = device.default_output_config().map_err(|err| {
            log::error!("No usable output configuration: {}", err);
            MixerError::BackendNotFound
        })?;
        let sample_rate = config.sample_rate.unwrap_or(default_config.sample_rate());
        let channels = config
            .channels
            .unwrap_or(usize::from(default_config.channels()));
        let channel_count = u16::try_from(channels).map_err(|_| MixerError::InvalidParameter)?;
        let buffer_frames =
            u32::try_from(config.buffer_size).map_err(|_| MixerError::InvalidParameter)?;

        engine.postinit(sample_rate, config.buffer_size, channels)?;
        log::info!(
            "Starting cpal backend... ({} ch@{} Hz)",
            channels,
            sample_rate
        );

        let stream_config = StreamConfig {
            channels: channel_count,
            sample_rate,
            buffer_size: BufferSize::Fixed(buffer_frames),
        };

        let running = Arc::new(AtomicBool::new(true));
        let callback_running = Arc::clone(&running);
        let callback_engine = Arc::clone(&engine);
        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if callback_running.load(Ordering::Acquire) {
                        callback_engine.mix(data, data.len() / channels);
                    } else {
                        data.fill(0.0);
                    }
                },
                |err| {
                    log::error!("Audio stream error: {}", err);
                },
                None,
            )
            .map_err(|err| {
                log::error!("Failed to build output stream: {}", err);
                MixerError::BackendNotFound
            })?;
        stream.play().map_err(|err| {
            log::error!("Failed to start output stream: {}", err);
            MixerError::BackendNotFound
        })?;

        engine.set_backend_cleanup(move || running.store(false, Ordering::Release));
        Ok(CpalBackend { stream })
    }

    fn name(&self) -> &'static str {
        "cpal"
    }
}

impl CpalBackend {
    pub fn pause(&self) -> Result<()> {
        self.stream.pause().map_err(|err| {
            log::error!("Failed to pause output stream: {}", err);
            MixerError::BackendNotFound
        })
    }
}

/// Mixes into a scratch buffer on a background thread, sleeping one period
/// between cycles.
pub struct NullBackend {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl AudioBackend for NullBackend {
    fn start(engine: Arc<Engine>, config: BackendConfig) -> Result<Self> {
        let sample_rate = config.sample_rate.unwrap_or(44_100);
        let channels = config.channels.unwrap_or(2);
        let buffer_size = config.buffer_size;
        engine.postinit(sample_rate, buffer_size, channels)?;
        log::info!(
            "Starting null backend... ({} ch@{} Hz)",
            channels,
            sample_rate
        );

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let thread_engine = Arc::clone(&engine);
        let period = Duration::from_secs_f64(buffer_size as f64 / f64::from(sample_rate));
        let thread = thread::spawn(move || {
            let mut buffer = vec![0.0; buffer_size * channels];
            while thread_running.load(Ordering::Acquire) {
                thread_engine.mix(&mut buffer, buffer_size);
                thread::sleep(period);
            }
        });

        let cleanup_running = Arc::clone(&running);
        engine.set_backend_cleanup(move || cleanup_running.store(false, Ordering::Release));
        Ok(NullBackend {
            running,
            thread: Some(thread),
        })
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

impl Drop for NullBackend {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            log::error!("Null backend thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_engine::EngineConfig;
    use crate::audio_engine::sample_loader::Sample;
    use std::time::Instant;

    #[test]
    fn test_logger_setup_is_idempotent() {
        setup_logger();
        setup_logger();
    }

    #[test]
    fn test_null_backend_drives_engine() {
        let engine = Arc::new(Engine::new(EngineConfig::default()));
        let config = BackendConfig {
            sample_rate: Some(48_000),
            buffer_size: 256,
            channels: Some(2),
        };
        let backend = NullBackend::start(Arc::clone(&engine), config).unwrap();
        assert_eq!(backend.name(), "null");
        assert_eq!(engine.get_backend_samplerate(), 48_000);
        assert_eq!(engine.get_backend_buffer_size(), 256);

        let sample = Sample::from_planar(vec![0.1; 48_000], 1, 48_000.0).unwrap();
        engine.play(&sample, None, 0.0, false, None);

        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.get_stream_time() == 0.0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(engine.get_stream_time() > 0.0);

        engine.deinit();
        let stopped_at = engine.get_stream_time();
        drop(backend);
        assert!(engine.get_stream_time() - stopped_at < 0.1);
    }

    #[test]
    fn test_null_backend_rejects_bad_format() {
        let engine = Arc::new(Engine::new(EngineConfig::default()));
        let config = BackendConfig {
            channels: Some(3),
            ..BackendConfig::default()
        };
        assert!(matches!(
            NullBackend::start(engine, config),
            Err(MixerError::InvalidParameter)
        ));
    }
}
