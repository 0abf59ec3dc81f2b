//! Session buffer accounting
//!
//! Commands modifying the card within a secure session consume space in a
//! card-side buffer whose capacity is declared at selection. The accountant
//! tracks the cumulative usage since the session was opened so that an
//! overflowing command is detected before it is sent.

use tracing::trace;

use crate::commands::CardCommand;

/// Capacity of the card session buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferCapacity {
    /// Capacity expressed in bytes, each command cost rounded up to `granularity`
    Bytes {
        /// Total capacity in bytes
        capacity: usize,
        /// Allocation unit of the card buffer
        granularity: usize,
    },
    /// Capacity expressed as a number of modifying commands
    Operations(usize),
}

impl BufferCapacity {
    /// Capacity in bytes with a one byte granularity
    pub const fn bytes(capacity: usize) -> Self {
        Self::Bytes {
            capacity,
            granularity: 1,
        }
    }

    /// Capacity in number of operations
    pub const fn operations(count: usize) -> Self {
        Self::Operations(count)
    }

    const fn limit(&self) -> usize {
        match self {
            Self::Bytes { capacity, .. } => *capacity,
            Self::Operations(count) => *count,
        }
    }
}

/// Tracks the session buffer usage of the current session
#[derive(Debug, Clone)]
pub struct SessionBufferAccountant {
    capacity: BufferCapacity,
    used: usize,
}

impl SessionBufferAccountant {
    /// Create an empty accountant
    pub const fn new(capacity: BufferCapacity) -> Self {
        Self { capacity, used: 0 }
    }

    /// Buffer units a command would consume, zero when it does not use the buffer
    pub fn cost(&self, command: &dyn CardCommand) -> usize {
        if !command.uses_session_buffer() {
            return 0;
        }
        match self.capacity {
            BufferCapacity::Operations(_) => 1,
            BufferCapacity::Bytes { granularity, .. } => {
                let size = command.request().command_length() + command.expected_response_length();
                size.div_ceil(granularity.max(1)) * granularity.max(1)
            }
        }
    }

    /// Whether admitting the command would exceed the capacity
    pub fn would_overflow(&self, command: &dyn CardCommand) -> bool {
        self.used + self.cost(command) > self.capacity.limit()
    }

    /// Whether the command could ever fit, even in an empty session
    pub fn fits_empty_session(&self, command: &dyn CardCommand) -> bool {
        self.cost(command) <= self.capacity.limit()
    }

    /// Account for a command about to be sent
    ///
    /// Returns `false`, leaving the usage untouched, when the command does not fit.
    pub fn admit(&mut self, command: &dyn CardCommand) -> bool {
        if self.would_overflow(command) {
            return false;
        }
        let cost = self.cost(command);
        self.used += cost;
        trace!(cost, used = self.used, capacity = self.capacity.limit(), "Session buffer usage");
        true
    }

    /// Units consumed since the session was opened
    pub const fn usage(&self) -> usize {
        self.used
    }

    /// Units still available
    pub const fn remaining(&self) -> usize {
        self.capacity.limit().saturating_sub(self.used)
    }

    /// Declared capacity
    pub const fn capacity(&self) -> BufferCapacity {
        self.capacity
    }

    /// Start accounting for a new session
    pub const fn reset(&mut self) {
        self.used = 0;
    }
}
