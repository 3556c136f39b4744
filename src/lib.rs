//! Sp3ctra: real-time conversion of a scanned image line into audio
//!
//! Three synthesis engines run as independent producers — an additive
//! partial bank scanned from the line, a polyphonic engine voiced from the
//! line's harmonic profile, and a photowave engine scanning an image-derived
//! waveform — all feeding one mixer callback through lock-free double
//! buffers.

pub mod audio;
pub mod config;
