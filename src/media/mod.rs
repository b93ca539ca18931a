mod rtp;
mod sequencer;
mod stream;

pub use rtp::{RtpHeader, RtpPacket};
pub use sequencer::{AudioSource, SequenceMerger};
pub use stream::{AudioSink, LegWriter, RtpEndpoint, spawn_camera_writer, spawn_sip_writer};
