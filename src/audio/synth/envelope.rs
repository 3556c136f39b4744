//! Four-stage ADSR envelope
//!
//! A deterministic tagged state machine advanced one sample at a time by the
//! engine producers. Attack always departs from the current level, so
//! retriggering a releasing voice cannot click. Parameter updates are applied
//! by the engines at block boundaries only.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdsrState {
    Idle,
    Attack,
    Decay,
    Sustain,
    Release,
}

/// Envelope timing parameters (seconds; sustain is a 0..1 level)
#[derive(Debug, Clone, Copy)]
pub struct AdsrParams {
    pub attack_s: f32,
    pub decay_s: f32,
    pub sustain_level: f32,
    pub release_s: f32,
}

impl AdsrParams {
    pub fn new(attack_s: f32, decay_s: f32, sustain_level: f32, release_s: f32) -> Self {
        Self {
            attack_s: attack_s.max(0.0),
            decay_s: decay_s.max(0.0),
            sustain_level: sustain_level.clamp(0.0, 1.0),
            release_s: release_s.max(0.0),
        }
    }
}

pub struct Adsr {
    params: AdsrParams,
    sample_dt: f32,
    state: AdsrState,
    level: f32,
    /// Level the current release started from
    release_from: f32,
}

impl Adsr {
    pub fn new(params: AdsrParams, sample_rate: u32) -> Self {
        Self {
            params,
            sample_dt: 1.0 / sample_rate as f32,
            state: AdsrState::Idle,
            level: 0.0,
            release_from: 0.0,
        }
    }

    pub fn state(&self) -> AdsrState {
        self.state
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn is_idle(&self) -> bool {
        self.state == AdsrState::Idle
    }

    /// Replace the timing parameters. Called at block boundaries; the level
    /// itself is untouched, so there is no discontinuity to smooth.
    pub fn set_params(&mut self, params: AdsrParams) {
        self.params = params;
    }

    /// Gate on: enter Attack from the current level
    pub fn note_on(&mut self) {
        self.state = AdsrState::Attack;
    }

    /// Gate off: enter Release from the current level
    pub fn note_off(&mut self) {
        if self.state == AdsrState::Idle {
            return;
        }
        if self.level <= 0.0 {
            self.state = AdsrState::Idle;
            self.level = 0.0;
            return;
        }
        self.release_from = self.level;
        self.state = AdsrState::Release;
    }

    /// Force back to Idle (used when a voice is stolen hard)
    pub fn reset(&mut self) {
        self.state = AdsrState::Idle;
        self.level = 0.0;
    }

    /// Advance one sample and return the new level
    pub fn next(&mut self) -> f32 {
        match self.state {
            AdsrState::Idle => {
                self.level = 0.0;
            }
            AdsrState::Attack => {
                if self.params.attack_s <= 0.0 {
                    self.level = 1.0;
                } else {
                    self.level += self.sample_dt / self.params.attack_s;
                }
                if self.level >= 1.0 {
                    self.level = 1.0;
                    self.state = AdsrState::Decay;
                }
            }
            AdsrState::Decay => {
                let sustain = self.params.sustain_level;
                if self.params.decay_s <= 0.0 {
                    self.level = sustain;
                } else {
                    self.level -= (1.0 - sustain) * self.sample_dt / self.params.decay_s;
                }
                if self.level <= sustain {
                    self.level = sustain;
                    self.state = AdsrState::Sustain;
                }
            }
            AdsrState::Sustain => {
                self.level = self.params.sustain_level;
            }
            AdsrState::Release => {
                if self.params.release_s <= 0.0 {
                    self.level = 0.0;
                } else {
                    self.level -= self.release_from * self.sample_dt / self.params.release_s;
                }
                if self.level <= 0.0 {
                    self.level = 0.0;
                    self.state = AdsrState::Idle;
                }
            }
        }
        self.level
    }
}
