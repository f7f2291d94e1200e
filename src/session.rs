//! Resumable sessions and the cache that holds them.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use nom::bytes::complete::take;
use nom::multi::many0;
use nom::number::complete::{be_u16, be_u32, be_u64, be_u8};
use nom::IResult;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::crypto::prf::MASTER_SECRET_LEN;
use crate::types::{CipherSuite, CompressionMethod, ProtocolVersion, SessionId, Side};
use crate::util::{all_consumed, put_vec16, put_vec24, put_vec8, vec16, vec24, vec8};
use crate::Error;

const SESSION_FORMAT: u8 = 1;
const FLAG_EXTENDED_MASTER_SECRET: u8 = 0x01;
const FLAG_ENCRYPT_THEN_MAC: u8 = 0x02;
const TICKET_NONCE_LEN: usize = 12;

/// The cacheable result of a completed handshake.
///
/// Immutable once created.
#[derive(Clone)]
pub struct Session {
    pub(crate) id: SessionId,
    pub(crate) ticket: Vec<u8>,
    pub(crate) master_secret: Zeroizing<[u8; MASTER_SECRET_LEN]>,
    pub(crate) version: ProtocolVersion,
    pub(crate) suite: CipherSuite,
    pub(crate) compression: CompressionMethod,
    pub(crate) peer_certificates: Vec<Vec<u8>>,
    pub(crate) start_time: SystemTime,
    pub(crate) server_name: Option<String>,
    pub(crate) extended_master_secret: bool,
    pub(crate) encrypt_then_mac: bool,
    pub(crate) side: Side,
    /// Ticket lifetime hint in seconds, 0 when there is no ticket.
    pub(crate) lifetime_hint: u32,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("ticket_len", &self.ticket.len())
            .field("version", &self.version)
            .field("suite", &self.suite)
            .field("server_name", &self.server_name)
            .field("side", &self.side)
            .field("extended_master_secret", &self.extended_master_secret)
            .field("encrypt_then_mac", &self.encrypt_then_mac)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// The ticket a client presents to resume, empty if none was issued.
    pub fn ticket(&self) -> &[u8] {
        &self.ticket
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn ciphersuite(&self) -> CipherSuite {
        self.suite
    }

    pub fn compression(&self) -> CompressionMethod {
        self.compression
    }

    /// Peer certificate chain, leaf first.
    pub fn peer_certificates(&self) -> &[Vec<u8>] {
        &self.peer_certificates
    }

    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    pub fn extended_master_secret(&self) -> bool {
        self.extended_master_secret
    }

    pub fn encrypt_then_mac(&self) -> bool {
        self.encrypt_then_mac
    }

    /// The side that created this session.
    pub fn side(&self) -> Side {
        self.side
    }

    pub fn lifetime_hint(&self) -> Duration {
        Duration::from_secs(self.lifetime_hint as u64)
    }

    pub(crate) fn master_secret(&self) -> &[u8; MASTER_SECRET_LEN] {
        &self.master_secret
    }

    /// Whether more than `lifetime` has passed since the session started.
    pub fn is_expired(&self, lifetime: Duration) -> bool {
        match self.start_time.elapsed() {
            Ok(age) => age >= lifetime,
            // Clock moved backwards.
            Err(_) => false,
        }
    }

    /// Compact binary encoding, including the master secret.
    pub fn serialize(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(128));
        out.push(SESSION_FORMAT);
        out.push(match self.side {
            Side::Client => 0,
            Side::Server => 1,
        });
        self.version.serialize(&mut out);
        out.extend_from_slice(&self.suite.as_u16().to_be_bytes());
        out.push(self.compression.as_u8());
        let mut flags = 0;
        if self.extended_master_secret {
            flags |= FLAG_EXTENDED_MASTER_SECRET;
        }
        if self.encrypt_then_mac {
            flags |= FLAG_ENCRYPT_THEN_MAC;
        }
        out.push(flags);
        let start = self
            .start_time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        out.extend_from_slice(&start.to_be_bytes());
        out.extend_from_slice(&self.lifetime_hint.to_be_bytes());
        out.extend_from_slice(&self.master_secret[..]);
        put_vec8(&mut out, self.id.as_bytes());
        put_vec16(
            &mut out,
            self.server_name.as_deref().unwrap_or_default().as_bytes(),
        );
        put_vec16(&mut out, &self.ticket);
        let mut chain = Vec::new();
        for cert in &self.peer_certificates {
            put_vec24(&mut chain, cert);
        }
        put_vec24(&mut out, &chain);
        out
    }

    /// Decode what [`Session::serialize`] produced.
    pub fn parse(input: &[u8]) -> Result<Session, Error> {
        let (_, session) = all_consumed(Self::parse_inner, input)?;
        session
    }

    fn parse_inner(input: &[u8]) -> IResult<&[u8], Result<Session, Error>> {
        let (input, format) = be_u8(input)?;
        let (input, side) = be_u8(input)?;
        let (input, version) = ProtocolVersion::parse(input)?;
        let (input, suite) = be_u16(input)?;
        let (input, compression) = CompressionMethod::parse(input)?;
        let (input, flags) = be_u8(input)?;
        let (input, start) = be_u64(input)?;
        let (input, lifetime_hint) = be_u32(input)?;
        let (input, ms) = take(MASTER_SECRET_LEN)(input)?;
        let (input, id) = vec8(input)?;
        let (input, server_name) = vec16(input)?;
        let (input, ticket) = vec16(input)?;
        let (input, chain) = vec24(input)?;
        let (_, certs) = all_consumed(many0(vec24), chain)?;

        let build = || -> Result<Session, Error> {
            if format != SESSION_FORMAT {
                return Err(Error::Decode(format!("Unknown session format {}", format)));
            }
            let side = match side {
                0 => Side::Client,
                1 => Side::Server,
                v => return Err(Error::Decode(format!("Bad session side {}", v))),
            };
            let suite = CipherSuite::from_u16(suite);
            if !suite.is_known() {
                return Err(Error::Decode("Unknown ciphersuite in session".into()));
            }
            let id = SessionId::new(id)
                .ok_or_else(|| Error::Decode("Session id too long".into()))?;
            let server_name = if server_name.is_empty() {
                None
            } else {
                Some(
                    String::from_utf8(server_name.to_vec())
                        .map_err(|_| Error::Decode("Server name not UTF-8".into()))?,
                )
            };
            let start_time = UNIX_EPOCH
                .checked_add(Duration::from_secs(start))
                .ok_or_else(|| Error::Decode("Session start time out of range".into()))?;
            let mut master_secret = Zeroizing::new([0u8; MASTER_SECRET_LEN]);
            master_secret.copy_from_slice(ms);
            Ok(Session {
                id,
                ticket: ticket.to_vec(),
                master_secret,
                version,
                suite,
                compression,
                peer_certificates: certs.into_iter().map(|c| c.to_vec()).collect(),
                start_time,
                server_name,
                extended_master_secret: flags & FLAG_EXTENDED_MASTER_SECRET != 0,
                encrypt_then_mac: flags & FLAG_ENCRYPT_THEN_MAC != 0,
                side,
                lifetime_hint,
            })
        };
        Ok((input, build()))
    }

    /// Seal this session into a ticket under `key`.
    ///
    /// The ticket is a random nonce followed by the AES-256-GCM encryption of
    /// the serialized session.
    pub(crate) fn seal(&self, key: &[u8; 32]) -> Result<Vec<u8>, Error> {
        let mut plain = self.clone();
        plain.ticket.clear();
        let encoded = plain.serialize();

        let aead = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let mut nonce = [0u8; TICKET_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = aead
            .encrypt(Nonce::from_slice(&nonce), encoded.as_slice())
            .map_err(|_| Error::CryptoError("Ticket encryption failed".into()))?;

        let mut out = Vec::with_capacity(TICKET_NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Open a ticket sealed by [`Session::seal`]. Any failure yields `None`.
    pub(crate) fn open(key: &[u8; 32], ticket: &[u8]) -> Option<Session> {
        if ticket.len() <= TICKET_NONCE_LEN {
            return None;
        }
        let (nonce, sealed) = ticket.split_at(TICKET_NONCE_LEN);
        let aead = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let encoded = Zeroizing::new(aead.decrypt(Nonce::from_slice(nonce), sealed).ok()?);
        let mut session = Session::parse(&encoded).ok()?;
        session.ticket = ticket.to_vec();
        Some(session)
    }
}

/// Storage for sessions that may later be resumed.
///
/// Shared between channels, so implementations synchronize internally.
pub trait SessionManager: Send + Sync {
    /// Find a session by id, as a server does for a resuming client.
    fn load(&self, id: &SessionId) -> Option<Session>;

    /// Find the latest session with a server, as a client does before
    /// connecting.
    fn load_for_server(&self, server_name: &str) -> Option<Session>;

    fn save(&self, session: &Session);

    fn remove(&self, id: &SessionId);

    /// Forget everything, returning how many sessions were dropped.
    fn remove_all(&self) -> usize;
}

/// Stores nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSessionManager;

impl SessionManager for NoopSessionManager {
    fn load(&self, _id: &SessionId) -> Option<Session> {
        None
    }

    fn load_for_server(&self, _server_name: &str) -> Option<Session> {
        None
    }

    fn save(&self, _session: &Session) {}

    fn remove(&self, _id: &SessionId) {}

    fn remove_all(&self) -> usize {
        0
    }
}

/// A bounded in-memory session table behind a single lock.
///
/// When full the oldest session is evicted. Sessions older than the
/// lifetime are never returned.
#[derive(Debug)]
pub struct InMemorySessionManager {
    max_sessions: usize,
    lifetime: Duration,
    table: Mutex<Table>,
}

#[derive(Debug, Default)]
struct Table {
    by_id: HashMap<Vec<u8>, Session>,
    by_server: HashMap<String, Vec<u8>>,
    /// Ids in insertion order, oldest first.
    order: VecDeque<Vec<u8>>,
}

impl Table {
    fn remove(&mut self, id: &[u8]) -> bool {
        let Some(session) = self.by_id.remove(id) else {
            return false;
        };
        if let Some(name) = &session.server_name {
            if self.by_server.get(name).map(|v| v.as_slice()) == Some(id) {
                self.by_server.remove(name);
            }
        }
        self.order.retain(|k| k != id);
        true
    }
}

impl InMemorySessionManager {
    pub fn new(max_sessions: usize, lifetime: Duration) -> Self {
        InMemorySessionManager {
            max_sessions: max_sessions.max(1),
            lifetime,
            table: Mutex::new(Table::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Table> {
        // Every update leaves the table consistent, poisoning is harmless.
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fresh(&self, table: &mut Table, id: &[u8]) -> Option<Session> {
        let session = table.by_id.get(id)?;
        if session.is_expired(self.lifetime) {
            trace!("Session {:?} expired", session.id);
            table.remove(id);
            return None;
        }
        Some(session.clone())
    }
}

impl Default for InMemorySessionManager {
    fn default() -> Self {
        InMemorySessionManager::new(1000, Duration::from_secs(24 * 60 * 60))
    }
}

impl SessionManager for InMemorySessionManager {
    fn load(&self, id: &SessionId) -> Option<Session> {
        if id.is_empty() {
            return None;
        }
        let mut table = self.lock();
        self.fresh(&mut table, id.as_bytes())
    }

    fn load_for_server(&self, server_name: &str) -> Option<Session> {
        let mut table = self.lock();
        let id = table.by_server.get(server_name)?.clone();
        self.fresh(&mut table, &id)
    }

    fn save(&self, session: &Session) {
        if session.id.is_empty() {
            return;
        }
        let id = session.id.as_bytes().to_vec();
        let mut table = self.lock();
        table.remove(&id);
        while table.by_id.len() >= self.max_sessions {
            let Some(oldest) = table.order.front().cloned() else {
                break;
            };
            table.remove(&oldest);
        }
        if session.side == Side::Client {
            if let Some(name) = &session.server_name {
                table.by_server.insert(name.clone(), id.clone());
            }
        }
        table.order.push_back(id.clone());
        table.by_id.insert(id, session.clone());
    }

    fn remove(&self, id: &SessionId) {
        self.lock().remove(id.as_bytes());
    }

    fn remove_all(&self) -> usize {
        let mut table = self.lock();
        let n = table.by_id.len();
        *table = Table::default();
        n
    }
}
