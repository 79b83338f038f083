//! Bounded-time MIDI parsing.
//!
//! Uses midly's lazy track and event iterators so that the deadline is checked
//! while parsing rather than after it. A pathological file (millions of events,
//! huge chunk counts) stops close to the deadline instead of running to
//! completion.

use crate::document::{Event, EventKind, MetaEvent, MidiDocument, SmfFormat, Timing, Track};
use crate::{Error, Result};
use midly::{Format, MetaMessage, MidiMessage, TrackEventKind};
use std::time::{Duration, Instant};

/// Events parsed between deadline checks.
const DEADLINE_CHECK_INTERVAL: usize = 64;

/// Parse MIDI bytes into a document, giving up once `deadline` has passed.
pub fn load(bytes: &[u8], deadline: Instant) -> Result<MidiDocument> {
    check_deadline(deadline)?;

    let (header, tracks) = midly::parse(bytes).map_err(|e| Error::Parse(e.to_string()))?;

    let format = match header.format {
        Format::SingleTrack => SmfFormat::SingleTrack,
        Format::Parallel => SmfFormat::Parallel,
        Format::Sequential => return Err(Error::UnsupportedFormat(2)),
    };

    let timing = match header.timing {
        midly::Timing::Metrical(ppq) => Timing::Metrical { ppq: ppq.as_int() },
        midly::Timing::Timecode(fps, subframes) => Timing::Timecode {
            fps: fps.as_f32(),
            subframes,
        },
    };

    let mut parsed = Vec::new();
    for track in tracks {
        check_deadline(deadline)?;
        let events = track.map_err(|e| Error::Parse(e.to_string()))?;

        let mut tick = 0u64;
        let mut out = Vec::new();
        for (i, event) in events.enumerate() {
            if i % DEADLINE_CHECK_INTERVAL == 0 {
                check_deadline(deadline)?;
            }
            let event = event.map_err(|e| Error::Parse(e.to_string()))?;
            tick += event.delta.as_int() as u64;
            out.push(Event::new(tick, convert_kind(event.kind)));
        }
        parsed.push(Track { events: out });
    }

    Ok(MidiDocument {
        format,
        timing,
        tracks: parsed,
    })
}

/// Parse with a relative timeout.
pub fn load_with_timeout(bytes: &[u8], timeout: Duration) -> Result<MidiDocument> {
    load(bytes, Instant::now() + timeout)
}

fn check_deadline(deadline: Instant) -> Result<()> {
    if Instant::now() >= deadline {
        Err(Error::ParseTimeout)
    } else {
        Ok(())
    }
}

fn convert_kind(kind: TrackEventKind<'_>) -> EventKind {
    match kind {
        TrackEventKind::Midi { channel, message } => {
            let channel = channel.as_int();
            match message {
                MidiMessage::NoteOff { key, vel } => EventKind::NoteOff {
                    channel,
                    key: key.as_int(),
                    velocity: vel.as_int(),
                },
                MidiMessage::NoteOn { key, vel } => EventKind::NoteOn {
                    channel,
                    key: key.as_int(),
                    velocity: vel.as_int(),
                },
                MidiMessage::Aftertouch { key, vel } => EventKind::Aftertouch {
                    channel,
                    key: key.as_int(),
                    pressure: vel.as_int(),
                },
                MidiMessage::Controller { controller, value } => EventKind::ControlChange {
                    channel,
                    controller: controller.as_int(),
                    value: value.as_int(),
                },
                MidiMessage::ProgramChange { program } => EventKind::ProgramChange {
                    channel,
                    program: program.as_int(),
                },
                MidiMessage::ChannelAftertouch { vel } => EventKind::ChannelPressure {
                    channel,
                    pressure: vel.as_int(),
                },
                MidiMessage::PitchBend { bend } => EventKind::PitchBend {
                    channel,
                    value: bend.0.as_int(),
                },
            }
        }
        TrackEventKind::SysEx(data) => EventKind::SysEx { data: data.to_vec() },
        TrackEventKind::Escape(data) => EventKind::Escape { data: data.to_vec() },
        TrackEventKind::Meta(meta) => EventKind::Meta(convert_meta(meta)),
    }
}

fn convert_meta(meta: MetaMessage<'_>) -> MetaEvent {
    let raw = |meta_type: u8, data: &[u8]| MetaEvent::Raw {
        meta_type,
        data: data.to_vec(),
    };
    match meta {
        MetaMessage::Tempo(t) => MetaEvent::Tempo {
            usec_per_quarter: t.as_int(),
        },
        MetaMessage::TimeSignature(numerator, denominator_pow, clocks, notated_32nds) => {
            MetaEvent::TimeSignature {
                numerator,
                denominator_pow,
                clocks,
                notated_32nds,
            }
        }
        MetaMessage::TrackName(name) => MetaEvent::TrackName {
            bytes: name.to_vec(),
        },
        MetaMessage::EndOfTrack => MetaEvent::EndOfTrack,
        MetaMessage::TrackNumber(n) => {
            let data = n.map(|n| n.to_be_bytes().to_vec()).unwrap_or_default();
            raw(0x00, &data)
        }
        MetaMessage::Text(t) => raw(0x01, t),
        MetaMessage::Copyright(t) => raw(0x02, t),
        MetaMessage::InstrumentName(t) => raw(0x04, t),
        MetaMessage::Lyric(t) => raw(0x05, t),
        MetaMessage::Marker(t) => raw(0x06, t),
        MetaMessage::CuePoint(t) => raw(0x07, t),
        MetaMessage::ProgramName(t) => raw(0x08, t),
        MetaMessage::DeviceName(t) => raw(0x09, t),
        MetaMessage::MidiChannel(ch) => raw(0x20, &[ch.as_int()]),
        MetaMessage::MidiPort(port) => raw(0x21, &[port.as_int()]),
        MetaMessage::SmpteOffset(smpte) => {
            let rate_code = match smpte.fps().as_int() {
                24 => 0u8,
                25 => 1,
                29 => 2,
                _ => 3,
            };
            raw(
                0x54,
                &[
                    (rate_code << 5) | smpte.hour(),
                    smpte.minute(),
                    smpte.second(),
                    smpte.frame(),
                    smpte.subframe(),
                ],
            )
        }
        MetaMessage::KeySignature(sharps, minor) => raw(0x59, &[sharps as u8, minor as u8]),
        MetaMessage::SequencerSpecific(data) => raw(0x7F, data),
        MetaMessage::Unknown(meta_type, data) => raw(meta_type, data),
    }
}
