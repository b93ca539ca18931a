//! Merges locally generated tones and live speech into one outbound RTP
//! sequence space.
//!
//! While a call is being set up, ringback tone packets pass through with
//! their native sequence numbers. The first speech packet switches the stream
//! over for good: tones are dropped from then on and every speech packet is
//! renumbered to continue directly after the last emitted tone, so the
//! receiver sees a single contiguous stream.

use super::rtp::RtpPacket;

/// Who produced a packet entering a leg's outbound stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSource {
    Speech,
    Tone,
}

/// Per-stream sequence state. One instance per call leg, replaced per call.
#[derive(Debug, Default)]
pub struct SequenceMerger {
    speech_started: bool,
    /// Highest sequence number emitted so far. Updated with a plain
    /// greater-than, not wraparound-aware.
    highest_local: Option<u16>,
    speech_offset: u16,
}

impl SequenceMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Renumber `packet` for this stream, in place.
    ///
    /// Returns `false` when the packet must be dropped instead of forwarded,
    /// which happens exactly for tone packets arriving after speech has begun.
    pub fn process(&mut self, packet: &mut RtpPacket, source: AudioSource) -> bool {
        let tone = source == AudioSource::Tone;
        if tone && self.speech_started {
            return false;
        }

        if !tone && !self.speech_started {
            self.speech_started = true;
            // First speech packet lands right after the last tone (or at 0
            // when no tone was ever emitted); the offset is fixed from here on.
            let next_local = self.highest_local.map_or(0, |seq| seq.wrapping_add(1));
            self.speech_offset = next_local.wrapping_sub(packet.header.sequence);
        }

        let local = if tone {
            packet.header.sequence
        } else {
            packet.header.sequence.wrapping_add(self.speech_offset)
        };

        if self.highest_local.is_none_or(|highest| local > highest) {
            self.highest_local = Some(local);
        }

        packet.header.sequence = local;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::RtpHeader;
    use bytes::Bytes;

    fn packet(sequence: u16) -> RtpPacket {
        RtpPacket::new(RtpHeader::new(96, sequence, 0, 1), Bytes::new())
    }

    fn run(merger: &mut SequenceMerger, sequence: u16, source: AudioSource) -> Option<u16> {
        let mut pkt = packet(sequence);
        merger.process(&mut pkt, source).then_some(pkt.header.sequence)
    }

    #[test]
    fn tones_keep_native_sequence_numbers() {
        let mut merger = SequenceMerger::new();
        assert_eq!(run(&mut merger, 4711, AudioSource::Tone), Some(4711));
        assert_eq!(run(&mut merger, 4712, AudioSource::Tone), Some(4712));
    }

    #[test]
    fn tone_after_speech_onset_is_dropped() {
        let mut merger = SequenceMerger::new();
        assert!(run(&mut merger, 100, AudioSource::Speech).is_some());
        assert_eq!(run(&mut merger, 101, AudioSource::Tone), None);
        assert_eq!(run(&mut merger, 500, AudioSource::Tone), None);
        // Speech keeps flowing renumbered.
        assert_eq!(run(&mut merger, 101, AudioSource::Speech), Some(1));
    }

    #[test]
    fn speech_continues_directly_after_tone_burst() {
        let mut merger = SequenceMerger::new();
        for seq in 0..=4u16 {
            assert_eq!(run(&mut merger, seq, AudioSource::Tone), Some(seq));
        }
        // First speech packet takes local sequence 5, later ones follow.
        assert_eq!(run(&mut merger, 900, AudioSource::Speech), Some(5));
        assert_eq!(run(&mut merger, 901, AudioSource::Speech), Some(6));
        assert_eq!(run(&mut merger, 902, AudioSource::Speech), Some(7));
    }

    #[test]
    fn speech_without_preceding_tones_starts_at_zero() {
        let mut merger = SequenceMerger::new();
        assert_eq!(run(&mut merger, 12345, AudioSource::Speech), Some(0));
        assert_eq!(run(&mut merger, 12346, AudioSource::Speech), Some(1));
    }

    #[test]
    fn speech_offset_wraps_modulo_two_to_sixteen() {
        let mut merger = SequenceMerger::new();
        for seq in 0..=2u16 {
            run(&mut merger, seq, AudioSource::Tone);
        }
        // offset = (2 + 1) - 65000 mod 2^16 = 539
        assert_eq!(run(&mut merger, 65000, AudioSource::Speech), Some(3));
        assert_eq!(run(&mut merger, 65535, AudioSource::Speech), Some(538));
        // Original counter wraps; the local one keeps stepping.
        assert_eq!(run(&mut merger, 0, AudioSource::Speech), Some(539));
    }

    #[test]
    fn high_water_mark_uses_plain_comparison() {
        let mut merger = SequenceMerger::new();
        assert_eq!(run(&mut merger, 10, AudioSource::Tone), Some(10));
        // Out-of-order tone is forwarded unchanged and does not move the mark.
        assert_eq!(run(&mut merger, 3, AudioSource::Tone), Some(3));
        // Speech continues after the highest mark, not the most recent tone.
        assert_eq!(run(&mut merger, 50, AudioSource::Speech), Some(11));
    }
}
