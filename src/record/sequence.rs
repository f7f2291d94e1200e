//! Record sequence numbers per epoch.

use std::collections::BTreeMap;

use crate::window::ReplayWindow;
use crate::Error;

/// Largest sequence number representable in a DTLS record header.
pub const MAX_DATAGRAM_SEQUENCE: u64 = (1 << 48) - 1;

/// Write counters and read validation state for every live epoch.
///
/// Stream transport requires strictly consecutive read sequence numbers.
/// Datagram transport keeps a replay window per epoch instead.
#[derive(Debug)]
pub struct SequenceNumbers {
    datagram: bool,
    write: BTreeMap<u16, u64>,
    read: BTreeMap<u16, ReadState>,
}

#[derive(Debug)]
enum ReadState {
    Stream { next: u64 },
    Datagram { window: ReplayWindow },
}

impl SequenceNumbers {
    pub fn new(datagram: bool) -> Self {
        let mut s = SequenceNumbers {
            datagram,
            write: BTreeMap::new(),
            read: BTreeMap::new(),
        };
        s.new_write_epoch(0);
        s.new_read_epoch(0);
        s
    }

    /// Start counting at zero for a new write epoch.
    ///
    /// Only the new and the immediately preceding epoch are kept, the latter
    /// for retransmitting a datagram flight.
    pub fn new_write_epoch(&mut self, epoch: u16) {
        self.write.insert(epoch, 0);
        self.write.retain(|e, _| *e + 1 >= epoch);
    }

    pub fn new_read_epoch(&mut self, epoch: u16) {
        let state = if self.datagram {
            ReadState::Datagram {
                window: ReplayWindow::new(),
            }
        } else {
            ReadState::Stream { next: 0 }
        };
        self.read.insert(epoch, state);
        self.read.retain(|e, _| *e + 1 >= epoch);
    }

    /// Issue the next outgoing sequence number for `epoch`.
    pub fn next_write_sequence(&mut self, epoch: u16) -> Result<u64, Error> {
        let limit = if self.datagram {
            MAX_DATAGRAM_SEQUENCE
        } else {
            u64::MAX
        };
        let counter = self
            .write
            .get_mut(&epoch)
            .ok_or_else(|| Error::InternalError(format!("No write epoch {}", epoch)))?;
        let seq = *counter;
        if seq >= limit {
            return Err(Error::SequenceOverflow);
        }
        *counter += 1;
        Ok(seq)
    }

    /// The implicit sequence number of the next stream record in `epoch`.
    pub fn next_read_sequence(&self, epoch: u16) -> Option<u64> {
        match self.read.get(&epoch)? {
            ReadState::Stream { next } => Some(*next),
            ReadState::Datagram { .. } => None,
        }
    }

    /// Whether a record with this sequence number may be processed.
    ///
    /// Does not change any state, see [`SequenceNumbers::mark_read`].
    pub fn check_read(&self, epoch: u16, sequence: u64) -> bool {
        match self.read.get(&epoch) {
            Some(ReadState::Stream { next }) => sequence == *next,
            Some(ReadState::Datagram { window }) => window.is_fresh(sequence),
            None => false,
        }
    }

    /// Record that an authenticated record with this sequence number was read.
    pub fn mark_read(&mut self, epoch: u16, sequence: u64) -> Result<(), Error> {
        match self.read.get_mut(&epoch) {
            Some(ReadState::Stream { next }) => {
                if sequence != *next {
                    return Err(Error::InternalError("Out of order stream record".into()));
                }
                *next = next.checked_add(1).ok_or(Error::SequenceOverflow)?;
                Ok(())
            }
            Some(ReadState::Datagram { window }) => {
                window.mark(sequence);
                Ok(())
            }
            None => Err(Error::InternalError(format!("No read epoch {}", epoch))),
        }
    }

    /// Check and, if accepted, mark in one step.
    pub fn accept(&mut self, epoch: u16, sequence: u64) -> bool {
        if !self.check_read(epoch, sequence) {
            return false;
        }
        self.mark_read(epoch, sequence).is_ok()
    }
}
