//! BLE MIDI transport containers.
//!
//! The BLE-MIDI event coder itself lives outside the core; the transport
//! only carries the sequencer endpoint, the two GATT characteristic paths
//! and the coder state containers it hands to the external coder.

use std::sync::Mutex;

/// Running state of the external BLE-MIDI coder for one direction.
#[derive(Debug, Default)]
pub struct MidiCoderState {
    /// MIDI running status byte, if one is active.
    pub running_status: Option<u8>,
    /// Last BLE timestamp, milliseconds modulo 2^13.
    pub timestamp: u16,
    /// Partially assembled event bytes.
    pub buffer: Vec<u8>,
}

impl MidiCoderState {
    /// Reset the coder between connections.
    pub fn reset(&mut self) {
        self.running_status = None;
        self.timestamp = 0;
        self.buffer.clear();
    }
}

/// MIDI-specific transport data.
#[derive(Debug)]
pub struct MidiData {
    /// ALSA sequencer client port.
    pub seq_port: i32,
    /// ALSA sequencer queue used for event scheduling.
    pub seq_queue: i32,
    /// GATT characteristic carrying notifications towards the remote.
    pub char_notify_path: String,
    /// GATT characteristic receiving writes from the remote.
    pub char_write_path: String,
    /// Encoder coder state.
    pub enc: Mutex<MidiCoderState>,
    /// Decoder coder state.
    pub dec: Mutex<MidiCoderState>,
}

impl MidiData {
    /// MIDI data for a freshly announced transport.
    pub fn new(seq_port: i32, seq_queue: i32, char_notify_path: String, char_write_path: String) -> Self {
        Self {
            seq_port,
            seq_queue,
            char_notify_path,
            char_write_path,
            enc: Mutex::new(MidiCoderState::default()),
            dec: Mutex::new(MidiCoderState::default()),
        }
    }
}
