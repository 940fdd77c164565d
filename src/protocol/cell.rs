//! Tor cell codec
//!
//! Serialises and deserialises the framed protocol units exchanged on a
//! link. Cells come in two length regimes: fixed-length cells are exactly
//! 514 bytes on the wire, variable-length cells carry a 2-byte length
//! prefix after the command byte. The codec knows the negotiated link
//! protocol version, which fixes the circuit-id width; it never touches
//! cryptography.

use crate::error::{Result, TorError};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Total size of a fixed-length cell on the wire
pub const CELL_LEN: usize = 514;

/// Payload size of a fixed-length cell (CELL_LEN - 4 circ_id - 1 command)
pub const PAYLOAD_LEN: usize = 509;

/// Maximum data bytes carried by a single RELAY_DATA cell
pub const RELAY_DATA_MAX: usize = 498;

/// Size of the relay cell header (command, recognised, stream id, digest, length)
pub const RELAY_HEADER_LEN: usize = 11;

/// Negotiated link protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkVersion {
    V3,
    V4,
    V5,
}

impl LinkVersion {
    /// Pick the highest common version from a peer's VERSIONS payload.
    pub fn negotiate(ours: &[u16], theirs: &[u16]) -> Result<Self> {
        let best = ours
            .iter()
            .filter(|v| theirs.contains(v))
            .max()
            .copied()
            .ok_or_else(|| {
                TorError::ProtocolViolation("no common link protocol version".into())
            })?;
        match best {
            3 => Ok(LinkVersion::V3),
            4 => Ok(LinkVersion::V4),
            5 => Ok(LinkVersion::V5),
            v => Err(TorError::ProtocolViolation(format!(
                "unsupported link protocol version {}",
                v
            ))),
        }
    }

    /// Width of the circuit-id field in bytes
    pub fn circ_id_len(&self) -> usize {
        match self {
            LinkVersion::V3 => 2,
            LinkVersion::V4 | LinkVersion::V5 => 4,
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            LinkVersion::V3 => 3,
            LinkVersion::V4 => 4,
            LinkVersion::V5 => 5,
        }
    }
}

/// Cell command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCommand {
    /// PADDING - link padding, dropped on receipt
    Padding = 0,
    /// CREATE - create a circuit (legacy)
    Create = 1,
    /// CREATED - circuit created (legacy)
    Created = 2,
    /// RELAY - relay cell
    Relay = 3,
    /// DESTROY - destroy a circuit
    Destroy = 4,
    /// CREATE_FAST - keyless circuit creation
    CreateFast = 5,
    /// CREATED_FAST - keyless circuit created
    CreatedFast = 6,
    /// VERSIONS - negotiate link protocol
    Versions = 7,
    /// NETINFO - address/time exchange
    Netinfo = 8,
    /// RELAY_EARLY - relay cell permitted during circuit construction
    RelayEarly = 9,
    /// CREATE2 - create a circuit (current)
    Create2 = 10,
    /// CREATED2 - circuit created (current)
    Created2 = 11,
    /// VPADDING - variable-length padding
    Vpadding = 128,
    /// CERTS - certificate cell
    Certs = 129,
    /// AUTH_CHALLENGE - authentication challenge
    AuthChallenge = 130,
    /// AUTHENTICATE - authenticate
    Authenticate = 131,
}

impl CellCommand {
    /// Parse command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            7 => Some(CellCommand::Versions),
            8 => Some(CellCommand::Netinfo),
            9 => Some(CellCommand::RelayEarly),
            10 => Some(CellCommand::Create2),
            11 => Some(CellCommand::Created2),
            128 => Some(CellCommand::Vpadding),
            129 => Some(CellCommand::Certs),
            130 => Some(CellCommand::AuthChallenge),
            131 => Some(CellCommand::Authenticate),
            _ => None,
        }
    }

    /// Whether this command uses the variable-length regime.
    ///
    /// VERSIONS and everything at or above 128 carries a 2-byte length
    /// prefix; everything else is padded to the fixed cell size.
    pub fn is_variable(&self) -> bool {
        matches!(
            self,
            CellCommand::Versions
                | CellCommand::Vpadding
                | CellCommand::Certs
                | CellCommand::AuthChallenge
                | CellCommand::Authenticate
        )
    }
}

/// A framed protocol unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Circuit ID (low 16 bits on a v3 link)
    pub circuit_id: u32,

    /// Command
    pub command: CellCommand,

    /// Payload; up to 509 bytes for fixed cells, 65535 for variable
    pub payload: Vec<u8>,
}

impl Cell {
    pub fn new(circuit_id: u32, command: CellCommand, payload: Vec<u8>) -> Self {
        Self {
            circuit_id,
            command,
            payload,
        }
    }

    /// Create a RELAY cell wrapping an already-encrypted relay payload
    pub fn relay(circuit_id: u32, relay_payload: Vec<u8>) -> Self {
        Self::new(circuit_id, CellCommand::Relay, relay_payload)
    }

    /// Create a RELAY_EARLY cell (used while a circuit is under construction)
    pub fn relay_early(circuit_id: u32, relay_payload: Vec<u8>) -> Self {
        Self::new(circuit_id, CellCommand::RelayEarly, relay_payload)
    }
}

/// Version-aware cell encoder/decoder tied to one link
#[derive(Debug, Clone, Copy)]
pub struct CellCodec {
    version: LinkVersion,
}

impl CellCodec {
    pub fn new(version: LinkVersion) -> Self {
        Self { version }
    }

    pub fn version(&self) -> LinkVersion {
        self.version
    }

    /// Serialise one cell to wire bytes.
    ///
    /// Fails with `InvalidPayload` if a fixed-regime payload exceeds 509
    /// bytes, or `BadLength` if a variable-regime payload exceeds 65535.
    pub fn encode(&self, cell: &Cell) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(CELL_LEN);
        self.write_circ_id(&mut buf, cell.circuit_id);
        buf.push(cell.command as u8);

        if cell.command.is_variable() {
            if cell.payload.len() > u16::MAX as usize {
                return Err(TorError::BadLength(cell.payload.len()));
            }
            buf.extend_from_slice(&(cell.payload.len() as u16).to_be_bytes());
            buf.extend_from_slice(&cell.payload);
        } else {
            if cell.payload.len() > PAYLOAD_LEN {
                return Err(TorError::InvalidPayload(format!(
                    "fixed cell payload {} exceeds {}",
                    cell.payload.len(),
                    PAYLOAD_LEN
                )));
            }
            buf.extend_from_slice(&cell.payload);
            // Right-pad with zeros to the fixed cell size
            buf.resize(self.version.circ_id_len() + 1 + PAYLOAD_LEN, 0);
        }

        Ok(buf)
    }

    /// Read exactly one cell from `reader`.
    ///
    /// Fails with `ShortRead` on EOF mid-cell and `UnknownCommand` for a
    /// command byte outside the assigned tables.
    pub async fn read_cell<R: AsyncRead + Unpin>(&self, reader: &mut R) -> Result<Cell> {
        let mut head = vec![0u8; self.version.circ_id_len() + 1];
        read_exact_or_short(reader, &mut head).await?;

        let (circuit_id, cmd_byte) = match self.version.circ_id_len() {
            2 => (u16::from_be_bytes([head[0], head[1]]) as u32, head[2]),
            _ => (
                u32::from_be_bytes([head[0], head[1], head[2], head[3]]),
                head[4],
            ),
        };

        let command =
            CellCommand::from_u8(cmd_byte).ok_or(TorError::UnknownCommand(cmd_byte))?;

        let payload = if command.is_variable() {
            let mut len_bytes = [0u8; 2];
            read_exact_or_short(reader, &mut len_bytes).await?;
            let len = u16::from_be_bytes(len_bytes) as usize;
            let mut payload = vec![0u8; len];
            read_exact_or_short(reader, &mut payload).await?;
            payload
        } else {
            let mut payload = vec![0u8; PAYLOAD_LEN];
            read_exact_or_short(reader, &mut payload).await?;
            payload
        };

        Ok(Cell {
            circuit_id,
            command,
            payload,
        })
    }

    /// Parse one fixed-length cell from a byte slice (used by tests and the
    /// pipeline; the wire path goes through `read_cell`).
    pub fn decode_fixed(&self, data: &[u8]) -> Result<Cell> {
        let id_len = self.version.circ_id_len();
        if data.len() < id_len + 1 + PAYLOAD_LEN {
            return Err(TorError::ShortRead);
        }
        let (circuit_id, cmd_byte) = match id_len {
            2 => (u16::from_be_bytes([data[0], data[1]]) as u32, data[2]),
            _ => (
                u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
                data[4],
            ),
        };
        let command =
            CellCommand::from_u8(cmd_byte).ok_or(TorError::UnknownCommand(cmd_byte))?;
        if command.is_variable() {
            return Err(TorError::ProtocolViolation(
                "variable-length cell in fixed decode path".into(),
            ));
        }
        Ok(Cell {
            circuit_id,
            command,
            payload: data[id_len + 1..id_len + 1 + PAYLOAD_LEN].to_vec(),
        })
    }

    fn write_circ_id(&self, buf: &mut Vec<u8>, circuit_id: u32) {
        match self.version.circ_id_len() {
            2 => buf.extend_from_slice(&(circuit_id as u16).to_be_bytes()),
            _ => buf.extend_from_slice(&circuit_id.to_be_bytes()),
        }
    }
}

async fn read_exact_or_short<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            TorError::ShortRead
        } else {
            TorError::LinkDropped(format!("read failed: {}", e))
        }
    })?;
    Ok(())
}

/// Relay command types (first byte of a relay cell)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    /// BEGIN - open stream
    Begin = 1,
    /// DATA - stream data
    Data = 2,
    /// END - close stream
    End = 3,
    /// CONNECTED - stream connected
    Connected = 4,
    /// SENDME - flow control
    Sendme = 5,
    /// EXTEND - extend circuit (legacy)
    Extend = 6,
    /// EXTENDED - circuit extended (legacy)
    Extended = 7,
    /// TRUNCATE - remove last hop
    Truncate = 8,
    /// TRUNCATED - last hop removed
    Truncated = 9,
    /// DROP - circuit-level padding
    Drop = 10,
    /// RESOLVE - remote DNS lookup
    Resolve = 11,
    /// RESOLVED - DNS answer
    Resolved = 12,
    /// BEGIN_DIR - open directory stream to the relay itself
    BeginDir = 13,
    /// EXTEND2 - extend circuit (current)
    Extend2 = 14,
    /// EXTENDED2 - circuit extended (current)
    Extended2 = 15,
    /// ESTABLISH_RENDEZVOUS - set up a rendezvous point
    EstablishRendezvous = 33,
    /// INTRODUCE1 - introduction request (client to intro point)
    Introduce1 = 34,
    /// RENDEZVOUS1 - service side of the rendezvous splice
    Rendezvous1 = 36,
    /// RENDEZVOUS2 - client side of the rendezvous splice
    Rendezvous2 = 37,
    /// RENDEZVOUS_ESTABLISHED - rendezvous point acknowledgement
    RendezvousEstablished = 39,
    /// INTRODUCE_ACK - introduction point acknowledgement
    IntroduceAck = 40,
}

impl RelayCommand {
    /// Parse relay command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            13 => Some(RelayCommand::BeginDir),
            14 => Some(RelayCommand::Extend2),
            15 => Some(RelayCommand::Extended2),
            33 => Some(RelayCommand::EstablishRendezvous),
            34 => Some(RelayCommand::Introduce1),
            36 => Some(RelayCommand::Rendezvous1),
            37 => Some(RelayCommand::Rendezvous2),
            39 => Some(RelayCommand::RendezvousEstablished),
            40 => Some(RelayCommand::IntroduceAck),
            _ => None,
        }
    }
}

/// Relay cell (payload within a RELAY or RELAY_EARLY cell)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    /// Relay command
    pub command: RelayCommand,

    /// Recognised field; zero once fully decrypted at the destination hop
    pub recognized: u16,

    /// Stream ID; zero for circuit-level commands
    pub stream_id: u16,

    /// Running-digest field (4 bytes)
    pub digest: [u8; 4],

    /// Data (up to 498 bytes)
    pub data: Vec<u8>,
}

impl RelayCell {
    /// Create a new relay cell with zeroed recognised and digest fields
    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Self {
        Self {
            command,
            recognized: 0,
            stream_id,
            digest: [0; 4],
            data,
        }
    }

    /// Serialise to the 509-byte relay payload, zero-padded.
    ///
    /// Fails with `InvalidPayload` if the data exceeds 498 bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.data.len() > RELAY_DATA_MAX {
            return Err(TorError::InvalidPayload(format!(
                "relay data {} exceeds {}",
                self.data.len(),
                RELAY_DATA_MAX
            )));
        }

        let mut buf = Vec::with_capacity(PAYLOAD_LEN);
        buf.push(self.command as u8);
        buf.extend_from_slice(&self.recognized.to_be_bytes());
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.extend_from_slice(&self.digest);
        buf.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf.resize(PAYLOAD_LEN, 0);

        Ok(buf)
    }

    /// Parse a relay cell from a fully decrypted 509-byte payload
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < RELAY_HEADER_LEN {
            return Err(TorError::ShortRead);
        }

        let command = RelayCommand::from_u8(data[0]).ok_or(TorError::UnknownCommand(data[0]))?;
        let recognized = u16::from_be_bytes([data[1], data[2]]);
        let stream_id = u16::from_be_bytes([data[3], data[4]]);
        let digest = [data[5], data[6], data[7], data[8]];
        let length = u16::from_be_bytes([data[9], data[10]]) as usize;

        if length > RELAY_DATA_MAX {
            return Err(TorError::BadLength(length));
        }
        let data_end = RELAY_HEADER_LEN + length;
        if data_end > data.len() {
            return Err(TorError::BadLength(length));
        }

        Ok(Self {
            command,
            recognized,
            stream_id,
            digest,
            data: data[RELAY_HEADER_LEN..data_end].to_vec(),
        })
    }
}
