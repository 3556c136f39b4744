//! Real-time audio: synthesis engines, lock-free handoff, mixer and driver
//!
//! Data flows one way: the image preprocessor and MIDI collaborators feed
//! the synthesis engines, each engine publishes stereo blocks through its
//! own double buffer, and the mixer callback on the driver thread consumes
//! whatever is ready.

pub mod buffer;
pub mod device;
pub mod engine;
pub mod midi;
pub mod mixer;
pub mod synth;
