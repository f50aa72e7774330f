//! Real-time software audio mixer.
//!
//! Many voices are blended into one interleaved output buffer per hardware
//! period. Sources are played through an [`Engine`], optionally into [`Bus`]
//! sub-mixes, and a backend pulls the result with [`Engine::mix`].

pub mod audio_engine;

pub use audio_engine::backend::{AudioBackend, BackendConfig, CpalBackend, NullBackend};
pub use audio_engine::bus::Bus;
pub use audio_engine::clipper::ClipMode;
pub use audio_engine::eq3::Eq3Filter;
pub use audio_engine::errors::{MixerError, Result, SampleLoadError};
pub use audio_engine::filter::{Filter, FilterInstance, FilterParams};
pub use audio_engine::handle::Handle;
pub use audio_engine::resampler::Resampler;
pub use audio_engine::sample_loader::Sample;
pub use audio_engine::source::{AudioSource, AudioStream, SeekFlags, Seeked, SourceFlags};
pub use audio_engine::{Engine, EngineConfig, EngineFlags, SpatialFactors, VoiceFlags};
