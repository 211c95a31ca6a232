//! Serial-triggered drifting grating stimulus.
//!
//! A microcontroller drives trial timing over a serial link. The [`link`] listener turns
//! its tokens into [`session`] transitions, and the [`grating`] renderer draws whatever the
//! session currently says on every display tick.

pub mod app;
pub mod batch;
pub mod config;
pub mod grating;
pub mod link;
pub mod session;
pub mod timer;

pub use app::App;
pub use config::{LinkConfig, RigConfig, StartCommand, StimulusConfig};
pub use grating::{FrameOutcome, GratingPattern, GratingRenderer};
pub use link::{LinkError, LinkListener, LinkWriter, SerialLink, TokenStream};
pub use session::{DisplayState, SessionState, SharedSession, Token, UnrecognizedToken};
pub use timer::{FrameClock, FrameStats};
