use crate::document::{EventKind, MetaEvent, MidiDocument, Timing, Track};

/// Serialize a document to Standard MIDI File bytes.
///
/// Every track is terminated with exactly one End of Track at its last tick;
/// any End of Track already present in the event list is dropped so edits
/// never leave a terminator mid-track. Running status is not used.
pub fn to_smf_bytes(doc: &MidiDocument) -> Vec<u8> {
    let tracks: Vec<Vec<u8>> = doc.tracks.iter().map(build_track).collect();
    build_midi_file(doc.format.as_u16(), division(&doc.timing), &tracks)
}

fn division(timing: &Timing) -> u16 {
    match *timing {
        Timing::Metrical { ppq } => ppq & 0x7FFF,
        Timing::Timecode { fps, subframes } => {
            // SMPTE rate is stored as a negative two's-complement byte.
            // 29.97 drop-frame is written as 29, never rounded up to 30.
            let rate = fps.trunc() as i8;
            (((-rate) as u8 as u16) << 8) | subframes as u16
        }
    }
}

fn build_track(track: &Track) -> Vec<u8> {
    let mut track_data = Vec::new();
    let mut last_tick = 0u64;

    for event in &track.events {
        if matches!(event.kind, EventKind::Meta(MetaEvent::EndOfTrack)) {
            continue;
        }
        let delta = event.tick.saturating_sub(last_tick);
        write_vlq(&mut track_data, delta.min(u32::MAX as u64) as u32);
        write_event(&mut track_data, &event.kind);
        last_tick = last_tick.max(event.tick);
    }

    // End of track
    let delta = track.last_tick().saturating_sub(last_tick);
    write_vlq(&mut track_data, delta as u32);
    track_data.extend_from_slice(&[0xFF, 0x2F, 0x00]);

    track_data
}

fn write_event(buf: &mut Vec<u8>, kind: &EventKind) {
    match kind {
        EventKind::NoteOff { channel, key, velocity } => {
            buf.extend_from_slice(&[0x80 | (channel & 0x0F), *key & 0x7F, *velocity & 0x7F]);
        }
        EventKind::NoteOn { channel, key, velocity } => {
            buf.extend_from_slice(&[0x90 | (channel & 0x0F), *key & 0x7F, *velocity & 0x7F]);
        }
        EventKind::Aftertouch { channel, key, pressure } => {
            buf.extend_from_slice(&[0xA0 | (channel & 0x0F), *key & 0x7F, *pressure & 0x7F]);
        }
        EventKind::ControlChange { channel, controller, value } => {
            buf.extend_from_slice(&[0xB0 | (channel & 0x0F), *controller & 0x7F, *value & 0x7F]);
        }
        EventKind::ProgramChange { channel, program } => {
            buf.extend_from_slice(&[0xC0 | (channel & 0x0F), *program & 0x7F]);
        }
        EventKind::ChannelPressure { channel, pressure } => {
            buf.extend_from_slice(&[0xD0 | (channel & 0x0F), *pressure & 0x7F]);
        }
        EventKind::PitchBend { channel, value } => {
            let v = value & 0x3FFF;
            buf.extend_from_slice(&[0xE0 | (channel & 0x0F), (v & 0x7F) as u8, (v >> 7) as u8]);
        }
        EventKind::SysEx { data } => {
            buf.push(0xF0);
            write_vlq(buf, data.len() as u32);
            buf.extend_from_slice(data);
        }
        EventKind::Escape { data } => {
            buf.push(0xF7);
            write_vlq(buf, data.len() as u32);
            buf.extend_from_slice(data);
        }
        EventKind::Meta(meta) => {
            let (meta_type, data) = meta.to_raw();
            buf.push(0xFF);
            buf.push(meta_type);
            write_vlq(buf, data.len() as u32);
            buf.extend_from_slice(&data);
        }
    }
}

/// Assemble a complete MIDI file from track data blobs.
fn build_midi_file(format: u16, division: u16, tracks: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = Vec::new();

    // MThd header
    buf.extend_from_slice(b"MThd");
    buf.extend_from_slice(&6u32.to_be_bytes());
    buf.extend_from_slice(&format.to_be_bytes());
    buf.extend_from_slice(&(tracks.len() as u16).to_be_bytes());
    buf.extend_from_slice(&division.to_be_bytes());

    // MTrk chunks
    for track_data in tracks {
        buf.extend_from_slice(b"MTrk");
        buf.extend_from_slice(&(track_data.len() as u32).to_be_bytes());
        buf.extend_from_slice(track_data);
    }

    buf
}

/// Write a variable-length quantity to a byte buffer.
fn write_vlq(buf: &mut Vec<u8>, mut value: u32) {
    // SMF caps delta times at four VLQ bytes.
    value = value.min(0x0FFF_FFFF);
    if value == 0 {
        buf.push(0);
        return;
    }

    let mut bytes = Vec::with_capacity(4);
    bytes.push((value & 0x7F) as u8);
    value >>= 7;

    while value > 0 {
        bytes.push((value & 0x7F) as u8 | 0x80);
        value >>= 7;
    }

    bytes.reverse();
    buf.extend_from_slice(&bytes);
}
