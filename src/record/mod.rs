//! Record layer: framing, per-epoch protection and output queueing.

use std::collections::{BTreeMap, VecDeque};

use nom::bytes::complete::take;
use nom::number::complete::be_u16;
use nom::IResult;

use crate::types::{ContentType, ProtocolVersion};
use crate::util::be_u48;
use crate::Error;

mod cipher;
pub use cipher::{CipherState, DirectionKeys, KeyMaterial};

mod sequence;
pub use sequence::{SequenceNumbers, MAX_DATAGRAM_SEQUENCE};

/// Largest plaintext fragment carried by one record.
pub const MAX_PLAINTEXT_LEN: usize = 16384;

/// Largest protected fragment a peer may send.
pub const MAX_CIPHERTEXT_LEN: usize = MAX_PLAINTEXT_LEN + 2048;

pub const TLS_HEADER_LEN: usize = 5;
pub const DTLS_HEADER_LEN: usize = 13;

/// The clear-text prefix of every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub content_type: ContentType,
    pub version: ProtocolVersion,
    /// Always 0 for stream transport, where epochs are implicit.
    pub epoch: u16,
    /// Always 0 for stream transport, where sequence numbers are implicit.
    pub sequence: u64,
    pub length: u16,
}

impl RecordHeader {
    pub fn header_len(datagram: bool) -> usize {
        if datagram {
            DTLS_HEADER_LEN
        } else {
            TLS_HEADER_LEN
        }
    }

    pub fn parse(input: &[u8], datagram: bool) -> IResult<&[u8], RecordHeader> {
        let (input, content_type) = ContentType::parse(input)?;
        let (input, version) = ProtocolVersion::parse(input)?;
        let (input, epoch, sequence) = if datagram {
            let (input, epoch) = be_u16(input)?;
            let (input, sequence) = be_u48(input)?;
            (input, epoch, sequence)
        } else {
            (input, 0, 0)
        };
        let (input, length) = be_u16(input)?;
        Ok((
            input,
            RecordHeader {
                content_type,
                version,
                epoch,
                sequence,
                length,
            },
        ))
    }

    pub fn serialize(&self, datagram: bool, output: &mut Vec<u8>) {
        output.push(self.content_type.as_u8());
        self.version.serialize(output);
        if datagram {
            output.extend_from_slice(&self.epoch.to_be_bytes());
            output.extend_from_slice(&self.sequence.to_be_bytes()[2..]);
        }
        output.extend_from_slice(&self.length.to_be_bytes());
    }
}

/// A record as read off the wire, before removing protection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub header: RecordHeader,
    pub fragment: Vec<u8>,
}

impl RawRecord {
    fn parse(input: &[u8], datagram: bool) -> IResult<&[u8], RawRecord> {
        let (input, header) = RecordHeader::parse(input, datagram)?;
        let (input, fragment) = take(header.length as usize)(input)?;
        Ok((
            input,
            RawRecord {
                header,
                fragment: fragment.to_vec(),
            },
        ))
    }
}

/// A record with protection removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub content_type: ContentType,
    pub version: ProtocolVersion,
    pub epoch: u16,
    pub sequence: u64,
    pub fragment: Vec<u8>,
}

/// Splits incoming bytes into records.
///
/// Stream input is buffered until a complete record is available. Datagram
/// input is processed one datagram at a time; a malformed tail is dropped.
#[derive(Debug)]
pub struct RecordReader {
    datagram: bool,
    buf: Vec<u8>,
}

impl RecordReader {
    pub fn new(datagram: bool) -> Self {
        RecordReader {
            datagram,
            buf: Vec::new(),
        }
    }

    pub fn push(&mut self, input: &[u8]) {
        if self.datagram {
            // Records never span datagrams.
            self.buf.clear();
        }
        self.buf.extend_from_slice(input);
    }

    /// Bytes still missing before the next stream record is complete.
    pub fn bytes_needed(&self) -> usize {
        if self.datagram {
            return 0;
        }
        if self.buf.len() < TLS_HEADER_LEN {
            return TLS_HEADER_LEN - self.buf.len();
        }
        let len = u16::from_be_bytes([self.buf[3], self.buf[4]]) as usize;
        (TLS_HEADER_LEN + len).saturating_sub(self.buf.len())
    }

    /// Pop the next complete record.
    pub fn next_record(&mut self) -> Result<Option<RawRecord>, Error> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let header_len = RecordHeader::header_len(self.datagram);
        if self.buf.len() < header_len {
            if self.datagram {
                trace!("Dropping {} trailing bytes of datagram", self.buf.len());
                self.buf.clear();
            }
            return Ok(None);
        }

        let header = match RecordHeader::parse(&self.buf, self.datagram) {
            Ok((_, h)) => h,
            Err(e) => {
                let err = Error::from(e);
                return self.malformed(err);
            }
        };

        let version_ok = if self.datagram {
            header.version.is_datagram()
        } else {
            header.version.major() == 3
        };
        if !version_ok {
            return self.malformed(Error::ProtocolVersion(header.version));
        }
        if header.length as usize > MAX_CIPHERTEXT_LEN {
            return self.malformed(Error::Decode(format!(
                "Record length {} exceeds maximum",
                header.length
            )));
        }
        if let ContentType::Unknown(v) = header.content_type {
            return self.malformed(Error::UnexpectedMessage(format!(
                "Unknown record type {}",
                v
            )));
        }

        if self.buf.len() < header_len + header.length as usize {
            if self.datagram {
                trace!("Dropping truncated record in datagram");
                self.buf.clear();
            }
            return Ok(None);
        }

        let parsed = RawRecord::parse(&self.buf, self.datagram)
            .map(|(rest, record)| (rest.len(), record))
            .map_err(Error::from);
        let (rest_len, record) = match parsed {
            Ok(v) => v,
            Err(err) => return self.malformed(err),
        };
        let consumed = self.buf.len() - rest_len;
        self.buf.drain(..consumed);
        Ok(Some(record))
    }

    fn malformed(&mut self, err: Error) -> Result<Option<RawRecord>, Error> {
        if self.datagram {
            debug!("Discarding malformed datagram: {}", err);
            self.buf.clear();
            Ok(None)
        } else {
            Err(err)
        }
    }
}

/// Protects and unprotects records for each live epoch.
///
/// For datagram transport the previous write epoch is kept so a lost final
/// flight can be retransmitted after the new keys are in use.
#[derive(Debug)]
pub struct RecordLayer {
    datagram: bool,
    max_datagram: usize,
    write_version: ProtocolVersion,
    read_version: Option<ProtocolVersion>,
    write_epoch: u16,
    read_epoch: u16,
    write_states: BTreeMap<u16, CipherState>,
    read_states: BTreeMap<u16, CipherState>,
    sequences: SequenceNumbers,
    output: VecDeque<Vec<u8>>,
    /// Whether the last queued output may be extended with more records.
    open_output: bool,
}

impl RecordLayer {
    pub fn new(datagram: bool, initial_version: ProtocolVersion, max_datagram: usize) -> Self {
        let mut write_states = BTreeMap::new();
        write_states.insert(0, CipherState::null());
        let mut read_states = BTreeMap::new();
        read_states.insert(0, CipherState::null());
        RecordLayer {
            datagram,
            max_datagram,
            write_version: initial_version,
            read_version: None,
            write_epoch: 0,
            read_epoch: 0,
            write_states,
            read_states,
            sequences: SequenceNumbers::new(datagram),
            output: VecDeque::new(),
            open_output: false,
        }
    }

    #[inline(always)]
    pub fn is_datagram(&self) -> bool {
        self.datagram
    }

    #[inline(always)]
    pub fn write_epoch(&self) -> u16 {
        self.write_epoch
    }

    #[inline(always)]
    pub fn read_epoch(&self) -> u16 {
        self.read_epoch
    }

    /// Version stamped on outgoing records.
    pub fn set_write_version(&mut self, version: ProtocolVersion) {
        self.write_version = version;
    }

    pub fn write_version(&self) -> ProtocolVersion {
        self.write_version
    }

    /// Once negotiated, incoming stream records must carry exactly this version.
    pub fn set_read_version(&mut self, version: ProtocolVersion) {
        self.read_version = Some(version);
    }

    /// Whether the current write state chains CBC IVs (TLS 1.0).
    pub fn write_uses_implicit_iv(&self) -> bool {
        self.write_states
            .get(&self.write_epoch)
            .map(|s| s.uses_implicit_iv())
            .unwrap_or(false)
    }

    /// Largest plaintext that still fits in one datagram at the current epoch.
    pub fn max_datagram_payload(&self) -> usize {
        let overhead = self
            .write_states
            .get(&self.write_epoch)
            .map(|s| s.max_overhead())
            .unwrap_or(0);
        self.max_datagram
            .saturating_sub(DTLS_HEADER_LEN + overhead)
            .max(1)
    }

    /// Switch writing to a new epoch protected by `state`.
    pub fn install_write(&mut self, state: CipherState) -> Result<(), Error> {
        let epoch = self
            .write_epoch
            .checked_add(1)
            .ok_or_else(|| Error::InternalError("Write epoch would wrap".into()))?;
        self.write_epoch = epoch;
        self.write_states.insert(epoch, state);
        self.sequences.new_write_epoch(epoch);
        let keep_previous = self.datagram;
        self.write_states
            .retain(|e, _| *e == epoch || (keep_previous && *e + 1 == epoch));
        debug!("Write epoch now {}", epoch);
        Ok(())
    }

    /// Switch reading to a new epoch protected by `state`.
    pub fn install_read(&mut self, state: CipherState) -> Result<(), Error> {
        let epoch = self
            .read_epoch
            .checked_add(1)
            .ok_or_else(|| Error::InternalError("Read epoch would wrap".into()))?;
        self.read_epoch = epoch;
        self.read_states.insert(epoch, state);
        self.sequences.new_read_epoch(epoch);
        let keep_previous = self.datagram;
        self.read_states
            .retain(|e, _| *e == epoch || (keep_previous && *e + 1 == epoch));
        debug!("Read epoch now {}", epoch);
        Ok(())
    }

    /// Protect one plaintext fragment at `epoch` and return the full record.
    pub fn encode(
        &mut self,
        content_type: ContentType,
        epoch: u16,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let sequence = self.sequences.next_write_sequence(epoch)?;
        let mac_seq = self.mac_sequence(epoch, sequence);
        let version = self.write_version;
        let state = self
            .write_states
            .get_mut(&epoch)
            .ok_or_else(|| Error::InternalError(format!("No write state for epoch {}", epoch)))?;
        let fragment = state.encrypt(mac_seq, content_type, version, plaintext)?;

        let header = RecordHeader {
            content_type,
            version,
            epoch,
            sequence,
            length: fragment.len() as u16,
        };
        let mut out = Vec::with_capacity(DTLS_HEADER_LEN + fragment.len());
        header.serialize(self.datagram, &mut out);
        out.extend_from_slice(&fragment);
        trace!(
            "Encoded {:?} record epoch {} seq {} len {}",
            content_type,
            epoch,
            sequence,
            fragment.len()
        );
        Ok(out)
    }

    /// Remove protection from a record.
    ///
    /// Returns `Ok(None)` when a datagram record is to be silently dropped:
    /// replays, authentication failures and records from an epoch whose keys
    /// are not yet installed.
    pub fn decode(&mut self, raw: &RawRecord) -> Result<Option<Record>, Error> {
        let header = &raw.header;

        if !self.datagram {
            if let Some(v) = self.read_version {
                if header.version != v {
                    return Err(Error::ProtocolVersion(header.version));
                }
            }
        }

        let (epoch, sequence) = if self.datagram {
            let epoch = header.epoch;
            if !self.read_states.contains_key(&epoch) {
                trace!("Dropping record for epoch {} without keys", epoch);
                return Ok(None);
            }
            if !self.sequences.check_read(epoch, header.sequence) {
                trace!("Dropping replayed record epoch {} seq {}", epoch, header.sequence);
                return Ok(None);
            }
            (epoch, header.sequence)
        } else {
            let epoch = self.read_epoch;
            let seq = self
                .sequences
                .next_read_sequence(epoch)
                .ok_or_else(|| Error::InternalError("No read sequence".into()))?;
            (epoch, seq)
        };

        let mac_seq = self.mac_sequence(epoch, sequence);
        let state = self
            .read_states
            .get_mut(&epoch)
            .ok_or_else(|| Error::InternalError(format!("No read state for epoch {}", epoch)))?;

        let fragment = match state.decrypt(mac_seq, header.content_type, header.version, &raw.fragment)
        {
            Ok(f) => f,
            Err(Error::BadRecordMac) if self.datagram => {
                debug!("Dropping record failing authentication, epoch {} seq {}", epoch, sequence);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        self.sequences.mark_read(epoch, sequence)?;

        Ok(Some(Record {
            content_type: header.content_type,
            version: header.version,
            epoch,
            sequence,
            fragment,
        }))
    }

    fn mac_sequence(&self, epoch: u16, sequence: u64) -> u64 {
        if self.datagram {
            ((epoch as u64) << 48) | sequence
        } else {
            sequence
        }
    }

    /// Encode `data` at the current write epoch, splitting into as many
    /// records as needed, and queue them for output.
    pub fn send(&mut self, content_type: ContentType, data: &[u8]) -> Result<(), Error> {
        let epoch = self.write_epoch;
        self.send_at(content_type, epoch, data)
    }

    pub fn send_at(&mut self, content_type: ContentType, epoch: u16, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            let record = self.encode(content_type, epoch, data)?;
            self.queue(record);
            return Ok(());
        }
        for chunk in data.chunks(MAX_PLAINTEXT_LEN) {
            let record = self.encode(content_type, epoch, chunk)?;
            self.queue(record);
        }
        Ok(())
    }

    /// Queue an encoded record.
    ///
    /// Stream records are coalesced into one output buffer. Datagram records
    /// are packed into datagrams up to the configured size.
    pub fn queue(&mut self, record: Vec<u8>) {
        if self.open_output {
            if let Some(last) = self.output.back_mut() {
                if !self.datagram || last.len() + record.len() <= self.max_datagram {
                    last.extend_from_slice(&record);
                    return;
                }
            }
        }
        self.output.push_back(record);
        self.open_output = true;
    }

    /// Next buffer to hand to the transport.
    pub fn poll_output(&mut self) -> Option<Vec<u8>> {
        self.open_output = false;
        self.output.pop_front()
    }

    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }
}
