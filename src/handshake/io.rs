//! Handshake message framing.
//!
//! On a stream the handshake is a byte stream of 4 byte headed messages that
//! may span records. On datagrams every message carries a sequence number
//! and may arrive fragmented, reordered or repeated, and our own flights
//! must be retransmitted until the peer answers.

use std::collections::BTreeMap;
use std::mem;
use std::time::Instant;

use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u24, be_u8};
use nom::IResult;

use crate::message::HandshakeType;
use crate::record::RecordLayer;
use crate::timer::{ExponentialBackoff, Timeout};
use crate::types::ContentType;
use crate::util::put_u24;
use crate::Error;

const STREAM_HEADER_LEN: usize = 4;
const DATAGRAM_HEADER_LEN: usize = 12;

/// Largest handshake message we are willing to buffer.
const MAX_MESSAGE_LEN: usize = 256 * 1024;

/// Bytes held for datagram messages that arrived ahead of their turn.
const MAX_BUFFERED_AHEAD: usize = 64 * 1024;

/// A complete handshake message.
#[derive(Debug)]
pub(crate) struct Message {
    pub msg_type: HandshakeType,
    /// Epoch of the record that carried the first fragment.
    pub epoch: u16,
    /// Header and body in the form that goes into the transcript.
    pub raw: Vec<u8>,
    header_len: usize,
}

impl Message {
    pub fn body(&self) -> &[u8] {
        &self.raw[self.header_len..]
    }
}

#[derive(Debug)]
struct FragmentHeader {
    msg_type: HandshakeType,
    length: usize,
    message_seq: u16,
    fragment_offset: usize,
    fragment_length: usize,
}

impl FragmentHeader {
    /// Parse one fragment, returning the header and the fragment bytes.
    fn parse(input: &[u8]) -> IResult<&[u8], (FragmentHeader, &[u8])> {
        let (input, msg_type) = HandshakeType::parse(input)?;
        let (input, length) = be_u24(input)?;
        let (input, message_seq) = be_u16(input)?;
        let (input, fragment_offset) = be_u24(input)?;
        let (input, fragment_length) = be_u24(input)?;
        let (input, data) = take(fragment_length)(input)?;
        Ok((
            input,
            (
                FragmentHeader {
                    msg_type,
                    length: length as usize,
                    message_seq,
                    fragment_offset: fragment_offset as usize,
                    fragment_length: fragment_length as usize,
                },
                data,
            ),
        ))
    }

    fn serialize(&self, output: &mut Vec<u8>) {
        output.push(self.msg_type.as_u8());
        put_u24(output, self.length);
        output.extend_from_slice(&self.message_seq.to_be_bytes());
        put_u24(output, self.fragment_offset);
        put_u24(output, self.fragment_length);
    }
}

/// A record saved for retransmission.
#[derive(Debug)]
struct Entry {
    content_type: ContentType,
    epoch: u16,
    fragment: Vec<u8>,
}

/// The fragments of one datagram message received so far.
#[derive(Debug)]
struct Reassembly {
    msg_type: HandshakeType,
    epoch: u16,
    /// Declared message length.
    length: usize,
    /// Grows with the fragments received, never past `length`.
    body: Vec<u8>,
    /// Received byte ranges, sorted and disjoint.
    ranges: Vec<(usize, usize)>,
}

impl Reassembly {
    fn new(msg_type: HandshakeType, epoch: u16, length: usize) -> Self {
        Reassembly {
            msg_type,
            epoch,
            length,
            body: Vec::new(),
            ranges: Vec::new(),
        }
    }

    /// How much `body` grows to hold bytes up to `end`.
    fn growth(&self, end: usize) -> usize {
        end.saturating_sub(self.body.len())
    }

    fn insert(&mut self, offset: usize, data: &[u8]) {
        let mut start = offset;
        let mut end = offset + data.len();
        if end > self.body.len() {
            self.body.resize(end, 0);
        }
        self.body[start..end].copy_from_slice(data);

        let mut merged = Vec::with_capacity(self.ranges.len() + 1);
        for &(s, e) in &self.ranges {
            if e < start || s > end {
                merged.push((s, e));
            } else {
                start = start.min(s);
                end = end.max(e);
            }
        }
        merged.push((start, end));
        merged.sort_unstable();
        self.ranges = merged;
    }

    fn is_complete(&self) -> bool {
        matches!(self.ranges.as_slice(), [(0, end)] if *end == self.length)
    }
}

/// Message level IO for the lifetime of a channel.
///
/// Sequence numbers restart with every handshake, the saved flight is kept
/// until the next flight begins so a lost final flight can be repeated.
#[derive(Debug)]
pub(crate) struct HandshakeIo {
    datagram: bool,
    max_queue_rx: usize,

    /// Stream handshake bytes not yet consumed as messages.
    stream_buf: Vec<u8>,

    /// Datagram messages being reassembled, keyed by message_seq.
    incoming: BTreeMap<u16, Reassembly>,
    next_send_seq: u16,
    next_recv_seq: u16,
    /// Read epoch in force when the current handshake started.
    handshake_epoch: u16,
    /// Messages handed out so far.
    received: u64,

    flight: Vec<Entry>,
    backoff: ExponentialBackoff,
    flight_timeout: Timeout,
    /// The saved flight was answered by the peer's last flight, not final itself.
    flight_expects_reply: bool,
}

impl HandshakeIo {
    pub fn new(datagram: bool, max_queue_rx: usize, backoff: ExponentialBackoff) -> Self {
        HandshakeIo {
            datagram,
            max_queue_rx: max_queue_rx.max(1),
            stream_buf: Vec::new(),
            incoming: BTreeMap::new(),
            next_send_seq: 0,
            next_recv_seq: 0,
            handshake_epoch: 0,
            received: 0,
            flight: Vec::new(),
            backoff,
            flight_timeout: Timeout::Disabled,
            flight_expects_reply: false,
        }
    }

    /// Reset sequence numbers for a handshake we start ourselves.
    pub fn start_handshake(&mut self, read_epoch: u16) {
        self.next_send_seq = 0;
        self.next_recv_seq = 0;
        self.handshake_epoch = read_epoch;
        self.incoming.clear();
    }

    /// Feed the plaintext of one handshake record.
    ///
    /// On datagrams, a repeated message that ends a peer flight means our
    /// answer got lost and the saved flight is sent again.
    pub fn push_record(
        &mut self,
        record: &mut RecordLayer,
        epoch: u16,
        fragment: &[u8],
    ) -> Result<(), Error> {
        if !self.datagram {
            if self.stream_buf.len() + fragment.len() > MAX_MESSAGE_LEN + STREAM_HEADER_LEN {
                return Err(Error::Decode("Handshake message too large".into()));
            }
            self.stream_buf.extend_from_slice(fragment);
            return Ok(());
        }

        let mut input = fragment;
        let mut resend = false;

        while !input.is_empty() {
            let (rest, (header, data)) = FragmentHeader::parse(input)?;
            input = rest;

            if header.length > MAX_MESSAGE_LEN {
                return Err(Error::Decode("Handshake message too large".into()));
            }
            if header.fragment_offset + header.fragment_length > header.length {
                return Err(Error::Decode("Handshake fragment beyond message end".into()));
            }

            let seq = header.message_seq;
            if seq < self.next_recv_seq {
                if self.starts_new_handshake(&header, epoch) {
                    debug!("Peer starts a new handshake in epoch {}", epoch);
                    self.start_handshake(epoch);
                } else {
                    trace!("Duplicate {:?} seq {}", header.msg_type, seq);
                    if header.fragment_offset == 0 && triggers_resend(header.msg_type) {
                        resend = true;
                    }
                    continue;
                }
            }

            if (seq - self.next_recv_seq) as usize >= self.max_queue_rx {
                debug!("Dropping {:?} seq {}, too far ahead", header.msg_type, seq);
                continue;
            }

            let conflicting = self
                .incoming
                .get(&seq)
                .map(|r| r.msg_type != header.msg_type || r.length != header.length)
                .unwrap_or(false);
            if conflicting {
                debug!("Replacing conflicting fragments for seq {}", seq);
                self.incoming.remove(&seq);
            }

            let end = header.fragment_offset + header.fragment_length;
            if seq != self.next_recv_seq {
                let growth = self
                    .incoming
                    .get(&seq)
                    .map(|r| r.growth(end))
                    .unwrap_or(end);
                if self.buffered_ahead() + growth > MAX_BUFFERED_AHEAD {
                    debug!(
                        "Dropping {:?} seq {} fragment, reassembly buffer full",
                        header.msg_type, seq
                    );
                    continue;
                }
            }

            self.incoming
                .entry(seq)
                .or_insert_with(|| Reassembly::new(header.msg_type, epoch, header.length))
                .insert(header.fragment_offset, data);
        }

        if resend {
            self.resend_flight(record, "duplicate from peer")?;
        }

        Ok(())
    }

    /// Reassembly bytes held for messages after the next expected one.
    fn buffered_ahead(&self) -> usize {
        self.incoming
            .iter()
            .filter(|(seq, _)| **seq != self.next_recv_seq)
            .map(|(_, r)| r.body.len())
            .sum()
    }

    /// A ClientHello or HelloRequest opening a handshake under newer keys
    /// than the ones in force when the current handshake began.
    fn starts_new_handshake(&self, header: &FragmentHeader, epoch: u16) -> bool {
        header.message_seq == 0
            && epoch > self.handshake_epoch
            && matches!(
                header.msg_type,
                HandshakeType::ClientHello | HandshakeType::HelloRequest
            )
    }

    /// Type of the next complete message, if there is one.
    pub fn peek_type(&self) -> Option<HandshakeType> {
        if self.datagram {
            self.incoming
                .get(&self.next_recv_seq)
                .filter(|r| r.is_complete())
                .map(|r| r.msg_type)
        } else {
            let (_, (msg_type, length)) = stream_header(&self.stream_buf).ok()?;
            if self.stream_buf.len() >= STREAM_HEADER_LEN + length {
                Some(msg_type)
            } else {
                None
            }
        }
    }

    /// Take the next complete message.
    pub fn next_message(&mut self) -> Result<Option<Message>, Error> {
        if self.datagram {
            let complete = self
                .incoming
                .get(&self.next_recv_seq)
                .map(|r| r.is_complete())
                .unwrap_or(false);
            if !complete {
                return Ok(None);
            }
            let seq = self.next_recv_seq;
            let Some(r) = self.incoming.remove(&seq) else {
                return Ok(None);
            };
            self.next_recv_seq = seq
                .checked_add(1)
                .ok_or_else(|| Error::InternalError("Handshake sequence exhausted".into()))?;

            // The peer is answering, stop repeating our flight.
            if self.flight_timeout != Timeout::Disabled {
                trace!("Stop flight timeout");
                self.flight_timeout = Timeout::Disabled;
            }

            let header = FragmentHeader {
                msg_type: r.msg_type,
                length: r.body.len(),
                message_seq: seq,
                fragment_offset: 0,
                fragment_length: r.body.len(),
            };
            let mut raw = Vec::with_capacity(DATAGRAM_HEADER_LEN + r.body.len());
            header.serialize(&mut raw);
            raw.extend_from_slice(&r.body);

            self.received += 1;
            trace!("Received {:?} seq {}", r.msg_type, seq);
            return Ok(Some(Message {
                msg_type: r.msg_type,
                epoch: r.epoch,
                raw,
                header_len: DATAGRAM_HEADER_LEN,
            }));
        }

        let (msg_type, length) = match stream_header(&self.stream_buf) {
            Ok((_, h)) => h,
            Err(_) => return Ok(None),
        };
        if length > MAX_MESSAGE_LEN {
            return Err(Error::Decode("Handshake message too large".into()));
        }
        let total = STREAM_HEADER_LEN + length;
        if self.stream_buf.len() < total {
            return Ok(None);
        }
        let rest = self.stream_buf.split_off(total);
        let raw = mem::replace(&mut self.stream_buf, rest);

        self.received += 1;
        trace!("Received {:?} len {}", msg_type, length);
        Ok(Some(Message {
            msg_type,
            epoch: 0,
            raw,
            header_len: STREAM_HEADER_LEN,
        }))
    }

    /// Count of messages taken with [`HandshakeIo::next_message`].
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Whether part of a message is buffered.
    ///
    /// ChangeCipherSpec must not interrupt a message.
    pub fn has_partial(&self) -> bool {
        if self.datagram {
            self.incoming.contains_key(&self.next_recv_seq)
        } else {
            !self.stream_buf.is_empty()
        }
    }

    pub fn flight_begin(&mut self) {
        if !self.datagram {
            return;
        }
        debug!("Begin flight");
        self.backoff.reset();
        self.flight.clear();
        self.flight_timeout = Timeout::Disabled;
    }

    /// Close the flight. Only flights that expect an answer are repeated on
    /// a timer, a final flight is only repeated when the peer asks.
    pub fn flight_end(&mut self, expect_reply: bool) {
        self.flight_expects_reply = expect_reply;
        if self.datagram && expect_reply {
            self.flight_timeout = Timeout::Unarmed;
        }
    }

    /// The handshake completed. Only a final flight is kept, to answer a
    /// peer that repeats its last flight. Anything else would be repeated
    /// back and forth.
    pub fn handshake_complete(&mut self) {
        if self.flight_expects_reply {
            self.flight.clear();
        }
        self.flight_timeout = Timeout::Disabled;
    }

    /// Send a handshake message, returning its transcript bytes.
    pub fn send_message(
        &mut self,
        record: &mut RecordLayer,
        msg_type: HandshakeType,
        body: &[u8],
    ) -> Result<Vec<u8>, Error> {
        if !self.datagram {
            let mut raw = Vec::with_capacity(STREAM_HEADER_LEN + body.len());
            raw.push(msg_type.as_u8());
            put_u24(&mut raw, body.len());
            raw.extend_from_slice(body);
            record.send(ContentType::Handshake, &raw)?;
            trace!("Sent {:?} len {}", msg_type, body.len());
            return Ok(raw);
        }

        let seq = self.next_send_seq;
        self.next_send_seq = seq
            .checked_add(1)
            .ok_or_else(|| Error::InternalError("Handshake sequence exhausted".into()))?;

        let mut header = FragmentHeader {
            msg_type,
            length: body.len(),
            message_seq: seq,
            fragment_offset: 0,
            fragment_length: body.len(),
        };
        let mut raw = Vec::with_capacity(DATAGRAM_HEADER_LEN + body.len());
        header.serialize(&mut raw);
        raw.extend_from_slice(body);

        let epoch = record.write_epoch();
        let max_body = record
            .max_datagram_payload()
            .saturating_sub(DATAGRAM_HEADER_LEN)
            .max(1);

        // At least one record, even for an empty body.
        let mut offset = 0;
        loop {
            let end = (offset + max_body).min(body.len());
            header.fragment_offset = offset;
            header.fragment_length = end - offset;

            let mut fragment = Vec::with_capacity(DATAGRAM_HEADER_LEN + end - offset);
            header.serialize(&mut fragment);
            fragment.extend_from_slice(&body[offset..end]);

            record.send_at(ContentType::Handshake, epoch, &fragment)?;
            self.flight.push(Entry {
                content_type: ContentType::Handshake,
                epoch,
                fragment,
            });

            offset = end;
            if offset >= body.len() {
                break;
            }
        }

        trace!("Sent {:?} seq {} len {}", msg_type, seq, body.len());
        Ok(raw)
    }

    pub fn send_change_cipher_spec(&mut self, record: &mut RecordLayer) -> Result<(), Error> {
        record.send(ContentType::ChangeCipherSpec, &[1])?;
        if self.datagram {
            self.flight.push(Entry {
                content_type: ContentType::ChangeCipherSpec,
                epoch: record.write_epoch(),
                fragment: vec![1],
            });
        }
        Ok(())
    }

    fn resend_flight(&mut self, record: &mut RecordLayer, reason: &str) -> Result<(), Error> {
        if self.flight.is_empty() {
            return Ok(());
        }
        debug!("Resending flight due to {}", reason);
        for entry in &self.flight {
            record.send_at(entry.content_type, entry.epoch, &entry.fragment)?;
        }
        Ok(())
    }

    /// Arm or fire the flight timer. Returns true if the flight was resent.
    pub fn handle_timeout(&mut self, record: &mut RecordLayer, now: Instant) -> Result<bool, Error> {
        if !self.datagram {
            return Ok(false);
        }
        if self.flight_timeout == Timeout::Unarmed {
            debug!(
                "Flight timeout in: {:.03}s",
                self.backoff.rto().as_secs_f32()
            );
            self.flight_timeout.arm(now, self.backoff.rto());
        }
        if !self.flight_timeout.is_expired(now) {
            return Ok(false);
        }

        self.backoff.attempt();
        debug!(
            "Re-arm flight timeout due to resend in {}",
            self.backoff.rto().as_secs_f32()
        );
        self.flight_timeout.arm(now, self.backoff.rto());
        self.resend_flight(record, "flight timeout")?;
        Ok(true)
    }

    /// When the flight timer fires next, if it runs.
    pub fn flight_deadline(&self) -> Option<Instant> {
        self.flight_timeout.deadline()
    }
}

fn stream_header(input: &[u8]) -> IResult<&[u8], (HandshakeType, usize)> {
    let (input, msg_type) = be_u8(input)?;
    let (input, length) = be_u24(input)?;
    Ok((input, (HandshakeType::from_u8(msg_type), length as usize)))
}

/// Messages that close a peer flight. Seeing one again means the peer
/// never got our answer to it.
fn triggers_resend(msg_type: HandshakeType) -> bool {
    matches!(
        msg_type,
        HandshakeType::ClientHello
            | HandshakeType::HelloVerifyRequest
            | HandshakeType::ServerHelloDone
            | HandshakeType::Finished
    )
}
