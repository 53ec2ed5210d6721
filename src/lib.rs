//! DVB recorder core: ingests a raw MPEG-2 transport stream, discovers
//! its frame structure, and writes self-describing segment files cut on
//! independent-frame boundaries, with a frame index for random access.
//!
//! The tuner side pushes bytes through [`Recorder::receive`]; a single
//! analyzer/writer thread drains them, locks onto the stream with the
//! [`detector::FrameDetector`], and prepends freshly generated PAT/PMT
//! tables ([`psi::PatPmtGenerator`]) to every independent frame.

pub mod channel;
pub mod config;
pub mod detector;
pub mod file;
pub mod index;
pub mod psi;
pub mod recorder;
pub mod ring;
pub mod ts;
pub mod writer;

pub use channel::ChannelDescriptor;
pub use config::RecorderConfig;
pub use recorder::{Recorder, RecorderState};
