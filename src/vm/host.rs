//! Host callbacks: the only channel through which a program touches the
//! outside world.
//!
//! The interpreter invokes these in program order, one call per side
//! effect, and never re-enters itself from inside a callback. None of them
//! can fault the VM; hosts encode I/O errors in-band in the returned value.

use super::Value;

/// The callback surface a host supplies at `Vm::init` time.
pub trait HostHooks {
    /// `IOW`: a value written to a device. Failures stay on the host side.
    fn io_write(&mut self, device: u8, value: Value);

    /// `IOR`: produce a value for a device read, typically an `Int`.
    fn io_read(&mut self, device: u8) -> Value;

    /// `WAIT`: the host may block, truncate, or ignore the delay.
    fn sleep(&mut self, ms: u32);

    /// Sink for `TRACE` output and collector diagnostics.
    fn trace(&mut self, level: u32, msg: &str);
}

/// A host that ignores writes and answers every read with `Int(0)`.
#[derive(Debug, Default)]
pub struct NullHost;

impl HostHooks for NullHost {
    fn io_write(&mut self, _device: u8, _value: Value) {}

    fn io_read(&mut self, _device: u8) -> Value {
        Value::Int(0)
    }

    fn sleep(&mut self, _ms: u32) {}

    fn trace(&mut self, _level: u32, _msg: &str) {}
}

/// One recorded host interaction, in program order.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    Write { device: u8, value: Value },
    Read { device: u8, value: Value },
    Sleep { ms: u32 },
    Trace { level: u32, msg: String },
}

/// A host that records every interaction and answers reads from a queue.
///
/// Used by the simulation harness and by tests asserting side-effect order.
#[derive(Debug, Default)]
pub struct RecordingHost {
    pub events: Vec<HostEvent>,
    /// Values handed out by `io_read`, front first; `Int(0)` when exhausted.
    pub read_queue: Vec<Value>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reads(read_queue: Vec<Value>) -> Self {
        Self {
            events: Vec::new(),
            read_queue,
        }
    }

    /// Devices written to, in order. Convenience for transcript asserts.
    pub fn writes(&self) -> Vec<(u8, Value)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                HostEvent::Write { device, value } => Some((*device, *value)),
                _ => None,
            })
            .collect()
    }
}

impl HostHooks for RecordingHost {
    fn io_write(&mut self, device: u8, value: Value) {
        self.events.push(HostEvent::Write { device, value });
    }

    fn io_read(&mut self, device: u8) -> Value {
        let value = if self.read_queue.is_empty() {
            Value::Int(0)
        } else {
            self.read_queue.remove(0)
        };
        self.events.push(HostEvent::Read { device, value });
        value
    }

    fn sleep(&mut self, ms: u32) {
        self.events.push(HostEvent::Sleep { ms });
    }

    fn trace(&mut self, level: u32, msg: &str) {
        self.events.push(HostEvent::Trace {
            level,
            msg: msg.to_string(),
        });
    }
}
