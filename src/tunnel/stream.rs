//! Per-stream bookkeeping for the multiplexer

use super::{TunnelError, DEFAULT_WINDOW_SIZE};

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Stream is open and active
    Open,
    /// Local side has closed
    HalfClosedLocal,
    /// Remote side has closed
    HalfClosedRemote,
    /// Stream is fully closed
    Closed,
}

/// Flow-control and close state of one multiplexed stream
#[derive(Debug)]
pub struct TunnelStream {
    id: u32,
    state: StreamState,
    /// Bytes we may still send before the peer grants more
    send_window: u32,
    /// Bytes the peer may still send before we grant more
    recv_window: u32,
}

impl TunnelStream {
    /// Create a new stream
    pub fn new(id: u32) -> Self {
        Self {
            id,
            state: StreamState::Open,
            send_window: DEFAULT_WINDOW_SIZE,
            recv_window: DEFAULT_WINDOW_SIZE,
        }
    }

    /// Get stream ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Get current state
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Remaining send credit
    pub fn send_window(&self) -> u32 {
        self.send_window
    }

    /// Check if stream can send data
    pub fn can_send(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedRemote)
    }

    /// Check if stream can receive data
    pub fn can_recv(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// Update send window
    pub fn update_send_window(&mut self, increment: u32) {
        self.send_window = self.send_window.saturating_add(increment);
    }

    /// Consume send window
    pub fn consume_send_window(&mut self, amount: u32) -> Result<(), TunnelError> {
        if amount > self.send_window {
            return Err(TunnelError::FlowControl(self.id));
        }
        self.send_window -= amount;
        Ok(())
    }

    /// Account for `len` bytes arriving from the peer
    pub fn receive(&mut self, len: u32) -> Result<(), TunnelError> {
        if !self.can_recv() {
            return Err(TunnelError::StreamClosed);
        }
        if len > self.recv_window {
            return Err(TunnelError::FlowControl(self.id));
        }
        self.recv_window -= len;
        Ok(())
    }

    /// Apply window update granted to the peer
    pub fn apply_window_update(&mut self, increment: u32) {
        self.recv_window = self.recv_window.saturating_add(increment);
    }

    /// Close local side
    pub fn close_local(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            _ => self.state,
        };
    }

    /// Close remote side
    pub fn close_remote(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            _ => self.state,
        };
    }

    /// Check if stream is fully closed
    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_flow_control() {
        let mut stream = TunnelStream::new(1);

        stream.receive(DEFAULT_WINDOW_SIZE - 10).unwrap();
        assert!(matches!(stream.receive(11), Err(TunnelError::FlowControl(1))));

        stream.apply_window_update(100);
        stream.receive(11).unwrap();

        stream.consume_send_window(DEFAULT_WINDOW_SIZE).unwrap();
        assert_eq!(stream.send_window(), 0);
        assert!(stream.consume_send_window(1).is_err());
        stream.update_send_window(5);
        assert_eq!(stream.send_window(), 5);
    }

    #[test]
    fn test_stream_states() {
        let mut stream = TunnelStream::new(1);
        assert_eq!(stream.state(), StreamState::Open);

        stream.close_local();
        assert_eq!(stream.state(), StreamState::HalfClosedLocal);
        assert!(!stream.can_send());
        assert!(stream.can_recv());

        stream.close_remote();
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(stream.is_closed());
        assert!(stream.receive(1).is_err());
    }
}
