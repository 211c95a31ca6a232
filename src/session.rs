use crate::link::LinkError;
use log::{debug, info};
use parking_lot::Mutex;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// What the projector is currently showing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayState {
    /// Idle / waiting, also the end of every trial
    #[default]
    Gray,
    /// Drifting grating visible
    Grating,
    /// Pattern blanked, trial still running
    Black,
}

/// Inbound tokens sent by the controller, one per line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    GratingOn,
    GratingOff,
    BlackScreen,
    TrialEnd,
    Exit,
    /// Terminal acknowledgement of the non-interactive exchange
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized token `{0}`")]
pub struct UnrecognizedToken(pub String);

impl FromStr for Token {
    type Err = UnrecognizedToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "GRATING_ON" => Token::GratingOn,
            "GRATING_OFF" => Token::GratingOff,
            "BLACK_SCREEN" => Token::BlackScreen,
            "TRIAL_END" => Token::TrialEnd,
            "EXIT" => Token::Exit,
            "DONE" => Token::Done,
            other => return Err(UnrecognizedToken(other.to_string())),
        })
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Token::GratingOn => "GRATING_ON",
            Token::GratingOff => "GRATING_OFF",
            Token::BlackScreen => "BLACK_SCREEN",
            Token::TrialEnd => "TRIAL_END",
            Token::Exit => "EXIT",
            Token::Done => "DONE",
        })
    }
}

/// Shared truth between the render loop and the link listener
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionState {
    pub display: DisplayState,
    /// Cycles drifted since the display last entered `Grating`
    pub phase: f64,
    pub trial_active: bool,
    pub should_terminate: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            display: DisplayState::Gray,
            phase: 0.0,
            trial_active: false,
            should_terminate: false,
        }
    }

    /// Applies one token. Returns false when the token left the state untouched.
    pub fn apply(&mut self, token: Token) -> bool {
        if self.should_terminate {
            return false;
        }
        match token {
            Token::GratingOn => {
                self.display = DisplayState::Grating;
                self.phase = 0.0;
            }
            Token::BlackScreen => self.display = DisplayState::Black,
            Token::TrialEnd => {
                self.display = DisplayState::Gray;
                self.trial_active = false;
            }
            Token::Exit => self.terminate(),
            // GRATING_OFF marks a controller sub-phase only, DONE belongs to batch mode
            Token::GratingOff | Token::Done => return false,
        }
        true
    }

    pub fn advance_phase(&mut self, delta_seconds: f64, drift_speed: f64) {
        if self.display == DisplayState::Grating {
            self.phase += drift_speed * delta_seconds;
        }
    }

    /// Reserves the trial slot. Fails while a trial runs or after termination.
    fn reserve_trial(&mut self) -> bool {
        if self.trial_active || self.should_terminate {
            return false;
        }
        self.trial_active = true;
        true
    }

    fn terminate(&mut self) {
        self.should_terminate = true;
        self.trial_active = false;
    }
}

/// Cloneable handle to the single mutex-guarded [`SessionState`].
///
/// Every method holds the lock only for the field assignments it performs, never across
/// channel I/O or a frame draw.
#[derive(Debug, Clone, Default)]
pub struct SharedSession {
    inner: Arc<Mutex<SessionState>>,
}

impl SharedSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SessionState {
        *self.inner.lock()
    }

    pub fn should_terminate(&self) -> bool {
        self.inner.lock().should_terminate
    }

    pub fn trial_active(&self) -> bool {
        self.inner.lock().trial_active
    }

    /// Starts a trial if none is running.
    ///
    /// On success the slot is marked active and `send` emits the start command with the lock
    /// released. A failed send rolls the slot back and surfaces the error so the operator can
    /// retry.
    pub fn on_trial_start_requested<F>(&self, send: F) -> Result<bool, LinkError>
    where
        F: FnOnce() -> Result<(), LinkError>,
    {
        if !self.inner.lock().reserve_trial() {
            debug!("Trial start ignored: trial already active or session terminating");
            return Ok(false);
        }

        match send() {
            Ok(()) => Ok(true),
            Err(e) => {
                self.inner.lock().trial_active = false;
                Err(e)
            }
        }
    }

    pub fn on_event(&self, token: Token) {
        let changed = self.inner.lock().apply(token);
        match (token, changed) {
            (Token::GratingOn, true) => info!("→ Grating ON"),
            (Token::GratingOff, _) => info!("→ Grating OFF"),
            (Token::BlackScreen, true) => info!("→ Black screen"),
            (Token::TrialEnd, true) => info!("→ Trial complete, press SPACE for the next trial"),
            (Token::Exit, true) => info!("→ Exit command received"),
            (token, _) => debug!("{token} left the session unchanged"),
        }
    }

    /// User-initiated abort, independent of trial state
    pub fn on_local_cancel(&self) {
        self.inner.lock().terminate();
    }

    pub fn on_link_failure(&self) {
        self.inner.lock().terminate();
    }

    pub fn advance_phase(&self, delta_seconds: f64, drift_speed: f64) {
        self.inner.lock().advance_phase(delta_seconds, drift_speed);
    }
}
