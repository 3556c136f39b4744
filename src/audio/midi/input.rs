//! MIDI device input handling
//!
//! Enumerates and connects to MIDI input devices (hardware and virtual) and
//! fans received messages out to the per-engine event queues. This is the
//! collaborator side of the engines' queue interface; engines themselves
//! never touch midir.

use midir::{MidiInput, MidiInputConnection};
use parking_lot::Mutex;
use std::sync::Arc;

use super::events::{MidiEvent, MidiEventQueue};

/// Information about a MIDI input device
#[derive(Debug, Clone, serde::Serialize)]
pub struct MidiDeviceInfo {
    /// Device index (for connection)
    pub index: usize,
    /// Device name
    pub name: String,
}

/// Active MIDI input connection
struct ActiveConnection {
    /// The midir connection (must be kept alive)
    #[allow(dead_code)]
    connection: MidiInputConnection<()>,
    device_name: String,
}

/// MIDI input manager: one connection, fanned out to the engine queues
pub struct MidiInputManager {
    connection: Mutex<Option<ActiveConnection>>,
    targets: Vec<Arc<MidiEventQueue>>,
}

impl MidiInputManager {
    /// Create a manager that forwards incoming events to every queue in
    /// `targets` (one per MIDI-driven engine).
    pub fn new(targets: Vec<Arc<MidiEventQueue>>) -> Self {
        Self {
            connection: Mutex::new(None),
            targets,
        }
    }

    /// List available MIDI input devices
    pub fn list_devices(&self) -> Result<Vec<MidiDeviceInfo>, String> {
        let midi_in = MidiInput::new("sp3ctra-enumerate")
            .map_err(|e| format!("Failed to create MIDI input: {}", e))?;

        let ports = midi_in.ports();
        let mut devices = Vec::with_capacity(ports.len());

        for (index, port) in ports.iter().enumerate() {
            let name = midi_in
                .port_name(port)
                .unwrap_or_else(|_| format!("Unknown Device {}", index));
            devices.push(MidiDeviceInfo { index, name });
        }

        Ok(devices)
    }

    /// Connect to a MIDI input device by index
    pub fn connect(&self, device_index: usize) -> Result<String, String> {
        self.disconnect();

        let midi_in = MidiInput::new("sp3ctra-input")
            .map_err(|e| format!("Failed to create MIDI input: {}", e))?;

        let ports = midi_in.ports();
        let port = ports
            .get(device_index)
            .ok_or_else(|| format!("Device index {} not found", device_index))?;

        let device_name = midi_in
            .port_name(port)
            .unwrap_or_else(|_| format!("Device {}", device_index));

        log::info!("Connecting to MIDI device: {}", device_name);

        let targets = self.targets.clone();
        let connection = midi_in
            .connect(
                port,
                "sp3ctra-midi-in",
                move |_timestamp, message, _| {
                    handle_midi_message(message, &targets);
                },
                (),
            )
            .map_err(|e| format!("Failed to connect to MIDI device: {}", e))?;

        *self.connection.lock() = Some(ActiveConnection {
            connection,
            device_name: device_name.clone(),
        });

        log::info!("Successfully connected to MIDI device: {}", device_name);
        Ok(device_name)
    }

    /// Disconnect from the current MIDI device
    pub fn disconnect(&self) {
        let mut conn = self.connection.lock();
        if let Some(active) = conn.take() {
            log::info!("Disconnecting from MIDI device: {}", active.device_name);
            // Dropping the connection closes the port. Silence everything
            // so no voice is left hanging without its note-off.
            for queue in &self.targets {
                queue.all_notes_off();
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.lock().is_some()
    }

    pub fn connected_device_name(&self) -> Option<String> {
        self.connection
            .lock()
            .as_ref()
            .map(|c| c.device_name.clone())
    }
}

impl Drop for MidiInputManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Parse a raw MIDI message and fan the resulting event out to every engine
fn handle_midi_message(message: &[u8], targets: &[Arc<MidiEventQueue>]) {
    if message.is_empty() {
        return;
    }

    let status = message[0];
    let message_type = status & 0xF0;

    let event = match message_type {
        // Note Off
        0x80 if message.len() >= 3 => {
            let note = message[1] & 0x7F;
            log::trace!("MIDI Note Off: note={}", note);
            Some(MidiEvent::NoteOff { note })
        }
        // Note On (velocity 0 is a Note Off in disguise)
        0x90 if message.len() >= 3 => {
            let note = message[1] & 0x7F;
            let velocity = message[2] & 0x7F;
            log::trace!("MIDI Note On: note={}, vel={}", note, velocity);
            if velocity == 0 {
                Some(MidiEvent::NoteOff { note })
            } else {
                Some(MidiEvent::NoteOn { note, velocity })
            }
        }
        // Control Change
        0xB0 if message.len() >= 3 => {
            let controller = message[1] & 0x7F;
            let value = message[2] & 0x7F;
            if controller == 123 {
                log::debug!("MIDI All Notes Off CC received");
                Some(MidiEvent::AllNotesOff)
            } else {
                log::trace!("MIDI CC: cc={}, value={}", controller, value);
                Some(MidiEvent::ControlChange { controller, value })
            }
        }
        // Other messages (aftertouch, program change, pitch bend...) ignored
        _ => {
            log::trace!("MIDI message: status=0x{:02X}, len={}", status, message.len());
            None
        }
    };

    if let Some(event) = event {
        for queue in targets {
            queue.push(event);
        }
    }
}
