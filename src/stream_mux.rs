//! Stream multiplexing
//!
//! Many application streams share one circuit. The multiplexer allocates
//! stream ids, translates the open/send/receive/close surface into
//! RELAY_BEGIN / RELAY_DATA / RELAY_END cells, runs remote DNS lookups
//! over RELAY_RESOLVE, and tags every stream with its isolation key.
//! Per-stream flow control and bounded receive queues give back-pressure
//! in both directions.

use crate::circuit::{Circuit, StreamMsg};
use crate::config::TorConfig;
use crate::error::{EndReason, Result, TorError};
use crate::isolation::IsolationKey;
use crate::protocol::{RelayCell, RelayCommand, SendmeWindow, RELAY_DATA_MAX};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Budget for RELAY_BEGIN to RELAY_CONNECTED
pub const STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Counters kept by the multiplexer
#[derive(Debug, Clone, Default)]
pub struct StreamMuxStats {
    pub streams_opened: u64,
    pub streams_closed: u64,
    pub streams_failed: u64,
    pub resolves: u64,
}

/// One address from a RELAY_RESOLVED answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddr {
    pub addr: IpAddr,
    pub ttl: u32,
}

/// Translates the abstract stream interface onto circuits
pub struct StreamMultiplexer {
    config: Arc<TorConfig>,
    stats: Mutex<StreamMuxStats>,
}

impl StreamMultiplexer {
    pub fn new(config: Arc<TorConfig>) -> Self {
        Self {
            config,
            stats: Mutex::new(StreamMuxStats::default()),
        }
    }

    pub fn stats(&self) -> StreamMuxStats {
        self.stats.lock().expect("stats lock poisoned").clone()
    }

    /// Open a stream to `host:port` on `circuit`.
    ///
    /// Sends RELAY_BEGIN on a fresh stream id and waits for
    /// RELAY_CONNECTED or RELAY_END.
    pub async fn open_stream(
        &self,
        circuit: &Arc<Circuit>,
        host: &str,
        port: u16,
        isolation: IsolationKey,
    ) -> Result<TorStream> {
        let payload = format!("{}:{}\0", host, port).into_bytes();
        self.begin(circuit, RelayCommand::Begin, payload, isolation)
            .await
    }

    /// Open a directory stream to the relay at the end of the circuit
    pub async fn open_dir_stream(
        &self,
        circuit: &Arc<Circuit>,
        isolation: IsolationKey,
    ) -> Result<TorStream> {
        self.begin(circuit, RelayCommand::BeginDir, Vec::new(), isolation)
            .await
    }

    async fn begin(
        &self,
        circuit: &Arc<Circuit>,
        command: RelayCommand,
        payload: Vec<u8>,
        isolation: IsolationKey,
    ) -> Result<TorStream> {
        let (stream_id, mut rx, _notify) = {
            let mut streams = circuit.streams.lock().expect("stream lock poisoned");
            streams.reserve(SendmeWindow::stream_level(
                self.config.stream_package_window,
                self.config.stream_deliver_window,
            ))?
        };

        circuit.mark_dirty();
        log::debug!(
            "circuit {}: opening stream {} ({:?})",
            circuit.id(),
            stream_id,
            command
        );

        if let Err(e) = circuit
            .send_relay(RelayCell::new(command, stream_id, payload), false)
            .await
        {
            self.drop_entry(circuit, stream_id);
            return Err(e);
        }

        let connected = timeout(STREAM_OPEN_TIMEOUT, rx.recv()).await;
        match connected {
            Err(_) => {
                self.drop_entry(circuit, stream_id);
                self.note_failed();
                Err(TorError::StreamOpenTimeout)
            }
            Ok(None) => {
                self.note_failed();
                Err(TorError::CircuitClosed("stream queue closed".into()))
            }
            Ok(Some(StreamMsg::Connected(_info))) => {
                self.stats.lock().expect("stats lock poisoned").streams_opened += 1;
                Ok(TorStream {
                    circuit: Arc::clone(circuit),
                    stream_id,
                    rx,
                    recv_buf: Vec::new(),
                    isolation,
                    closed: false,
                })
            }
            Ok(Some(StreamMsg::End(reason))) => {
                // The entry was already removed by the reactor
                self.note_failed();
                Err(TorError::StreamEnd(reason))
            }
            Ok(Some(StreamMsg::Failed(e))) => {
                self.note_failed();
                Err(e)
            }
            Ok(Some(other)) => {
                self.drop_entry(circuit, stream_id);
                self.note_failed();
                Err(TorError::ProtocolViolation(format!(
                    "unexpected {:?} while opening stream",
                    std::mem::discriminant(&other)
                )))
            }
        }
    }

    /// Resolve a hostname over the circuit (RELAY_RESOLVE/RESOLVED).
    ///
    /// Uses a dedicated stream id that never carries payload data.
    pub async fn resolve(
        &self,
        circuit: &Arc<Circuit>,
        host: &str,
    ) -> Result<Vec<ResolvedAddr>> {
        let answers = self.resolve_raw(circuit, host).await?;
        let mut addrs = Vec::new();
        for answer in answers {
            match answer {
                ResolvedAnswer::Addr(resolved) => addrs.push(resolved),
                ResolvedAnswer::Hostname(_, _) => {}
                ResolvedAnswer::Error(transient) => {
                    self.note_failed();
                    return Err(if transient {
                        TorError::Timeout(format!("transient DNS failure for {}", host))
                    } else {
                        TorError::StreamEnd(EndReason::ResolveFailed)
                    });
                }
            }
        }
        Ok(addrs)
    }

    /// Reverse lookup: hostname (and TTL) for an address
    pub async fn resolve_ptr(&self, circuit: &Arc<Circuit>, addr: IpAddr) -> Result<(String, u32)> {
        let query = ptr_query_name(addr);
        let answers = self.resolve_raw(circuit, &query).await?;
        for answer in answers {
            match answer {
                ResolvedAnswer::Hostname(name, ttl) => return Ok((name, ttl)),
                ResolvedAnswer::Error(_) => {
                    self.note_failed();
                    return Err(TorError::StreamEnd(EndReason::ResolveFailed));
                }
                ResolvedAnswer::Addr(_) => {}
            }
        }
        Err(TorError::StreamEnd(EndReason::ResolveFailed))
    }

    async fn resolve_raw(
        &self,
        circuit: &Arc<Circuit>,
        name: &str,
    ) -> Result<Vec<ResolvedAnswer>> {
        let (stream_id, mut rx, _notify) = {
            let mut streams = circuit.streams.lock().expect("stream lock poisoned");
            streams.reserve(SendmeWindow::stream_level(
                self.config.stream_package_window,
                self.config.stream_deliver_window,
            ))?
        };
        circuit.mark_dirty();
        self.stats.lock().expect("stats lock poisoned").resolves += 1;

        let mut payload = name.as_bytes().to_vec();
        payload.push(0);
        if let Err(e) = circuit
            .send_relay(RelayCell::new(RelayCommand::Resolve, stream_id, payload), false)
            .await
        {
            self.drop_entry(circuit, stream_id);
            return Err(e);
        }

        let result = match timeout(STREAM_OPEN_TIMEOUT, rx.recv()).await {
            Err(_) => Err(TorError::StreamOpenTimeout),
            Ok(None) => Err(TorError::CircuitClosed("stream queue closed".into())),
            Ok(Some(StreamMsg::Resolved(data))) => parse_resolved(&data),
            Ok(Some(StreamMsg::End(reason))) => Err(TorError::StreamEnd(reason)),
            Ok(Some(StreamMsg::Failed(e))) => Err(e),
            Ok(Some(_)) => Err(TorError::ProtocolViolation(
                "unexpected cell during resolve".into(),
            )),
        };

        self.drop_entry(circuit, stream_id);
        result
    }

    fn drop_entry(&self, circuit: &Arc<Circuit>, stream_id: u16) {
        circuit
            .streams
            .lock()
            .expect("stream lock poisoned")
            .remove(stream_id);
    }

    fn note_failed(&self) {
        self.stats.lock().expect("stats lock poisoned").streams_failed += 1;
    }

    pub fn note_closed(&self) {
        self.stats.lock().expect("stats lock poisoned").streams_closed += 1;
    }
}

/// One parsed RESOLVED entry
enum ResolvedAnswer {
    Addr(ResolvedAddr),
    Hostname(String, u32),
    /// `true` for a transient error
    Error(bool),
}

/// Parse a RELAY_RESOLVED payload: repeated
/// `type (1) | length (1) | value | TTL (4)`
fn parse_resolved(data: &[u8]) -> Result<Vec<ResolvedAnswer>> {
    let mut answers = Vec::new();
    let mut offset = 0;
    while offset + 2 <= data.len() {
        let answer_type = data[offset];
        let len = data[offset + 1] as usize;
        offset += 2;
        if offset + len + 4 > data.len() {
            return Err(TorError::ProtocolViolation(
                "truncated RESOLVED entry".into(),
            ));
        }
        let value = &data[offset..offset + len];
        let ttl = u32::from_be_bytes([
            data[offset + len],
            data[offset + len + 1],
            data[offset + len + 2],
            data[offset + len + 3],
        ]);
        offset += len + 4;

        match answer_type {
            0x00 => {
                let name = String::from_utf8_lossy(value).into_owned();
                answers.push(ResolvedAnswer::Hostname(name, ttl));
            }
            0x04 if len == 4 => {
                let octets: [u8; 4] = value.try_into().expect("length checked");
                answers.push(ResolvedAnswer::Addr(ResolvedAddr {
                    addr: IpAddr::from(octets),
                    ttl,
                }));
            }
            0x06 if len == 16 => {
                let octets: [u8; 16] = value.try_into().expect("length checked");
                answers.push(ResolvedAnswer::Addr(ResolvedAddr {
                    addr: IpAddr::from(octets),
                    ttl,
                }));
            }
            0xF0 => answers.push(ResolvedAnswer::Error(true)),
            0xF1 => answers.push(ResolvedAnswer::Error(false)),
            other => {
                log::debug!("ignoring RESOLVED entry type {:#04x}", other);
            }
        }
    }
    Ok(answers)
}

/// PTR query name for an address (in-addr.arpa / ip6.arpa form)
fn ptr_query_name(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut name = String::with_capacity(72);
            for byte in v6.octets().iter().rev() {
                name.push_str(&format!("{:x}.{:x}.", byte & 0x0F, byte >> 4));
            }
            name.push_str("ip6.arpa");
            name
        }
    }
}

/// A connected stream handle
pub struct TorStream {
    circuit: Arc<Circuit>,
    stream_id: u16,
    rx: mpsc::Receiver<StreamMsg>,
    recv_buf: Vec<u8>,
    isolation: IsolationKey,
    closed: bool,
}

impl TorStream {
    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    pub fn isolation(&self) -> &IsolationKey {
        &self.isolation
    }

    pub fn circuit(&self) -> &Arc<Circuit> {
        &self.circuit
    }

    /// Write all of `data`, chunked at the relay cell data limit.
    ///
    /// Blocks when the circuit- or stream-level package window is empty.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(TorError::CircuitClosed("stream closed".into()));
        }
        for chunk in data.chunks(RELAY_DATA_MAX) {
            self.circuit
                .send_stream_data(self.stream_id, chunk.to_vec())
                .await?;
        }
        Ok(())
    }

    /// Read some bytes into `buf`; 0 means clean end-of-stream
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.recv_buf.is_empty() {
            loop {
                match self.rx.recv().await {
                    None => return Err(TorError::CircuitClosed("stream queue closed".into())),
                    Some(StreamMsg::Data(data)) => {
                        self.recv_buf = data;
                        break;
                    }
                    Some(StreamMsg::End(EndReason::Done)) => {
                        self.closed = true;
                        return Ok(0);
                    }
                    Some(StreamMsg::End(reason)) => {
                        self.closed = true;
                        return Err(TorError::StreamEnd(reason));
                    }
                    Some(StreamMsg::Failed(e)) => {
                        self.closed = true;
                        return Err(e);
                    }
                    Some(StreamMsg::Connected(_)) | Some(StreamMsg::Resolved(_)) => continue,
                }
            }
        }

        let n = buf.len().min(self.recv_buf.len());
        buf[..n].copy_from_slice(&self.recv_buf[..n]);
        self.recv_buf.drain(..n);
        Ok(n)
    }

    /// Read until clean end-of-stream
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match self.read(&mut buf).await {
                Ok(0) => return Ok(out),
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) => return Err(e),
            }
        }
    }

    /// Clean shutdown: RELAY_END with reason DONE
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.circuit
            .streams
            .lock()
            .expect("stream lock poisoned")
            .remove(self.stream_id);
        self.circuit
            .send_relay(
                RelayCell::new(
                    RelayCommand::End,
                    self.stream_id,
                    vec![EndReason::Done as u8],
                ),
                false,
            )
            .await
    }
}

impl Drop for TorStream {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Best effort: free the id now, send the END in the background
        self.circuit
            .streams
            .lock()
            .expect("stream lock poisoned")
            .remove(self.stream_id);
        let circuit = Arc::clone(&self.circuit);
        let stream_id = self.stream_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = circuit
                    .send_relay(
                        RelayCell::new(RelayCommand::End, stream_id, vec![EndReason::Done as u8]),
                        false,
                    )
                    .await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::test_support::{open_circuit, FakeRelaySide};
    use crate::circuit::CircuitState;
    use crate::path::test_support::test_relay;

    fn mux() -> StreamMultiplexer {
        StreamMultiplexer::new(Arc::new(TorConfig::default()))
    }

    /// Happy path: BEGIN, CONNECTED, DATA both ways, clean END.
    #[tokio::test]
    async fn test_stream_end_to_end() {
        let exit = test_relay("exit", 50, [10, 50, 0, 1]);
        let (circuit, relay_side) = open_circuit(exit);
        let mut relay = FakeRelaySide::new(relay_side, circuit.id());
        let mux = mux();

        let client = async {
            let mut stream = mux
                .open_stream(
                    &circuit,
                    "example.com",
                    80,
                    IsolationKey::destination("example.com", 80),
                )
                .await
                .expect("stream opens");

            stream.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
            let response = stream.read_to_end().await.unwrap();
            assert_eq!(response, b"HTTP/1.0 200 OK\r\n\r\nhi");
            stream.close().await.unwrap();
        };

        let relay_task = async {
            let begin = relay.recv_relay().await;
            assert_eq!(begin.command, RelayCommand::Begin);
            assert_eq!(begin.data, b"example.com:80\0".to_vec());
            let stream_id = begin.stream_id;
            assert_ne!(stream_id, 0);

            relay
                .send_relay(RelayCell::new(RelayCommand::Connected, stream_id, vec![]))
                .await;

            let data = relay.recv_relay().await;
            assert_eq!(data.command, RelayCommand::Data);
            assert_eq!(data.data, b"GET / HTTP/1.0\r\n\r\n".to_vec());

            relay
                .send_relay(RelayCell::new(
                    RelayCommand::Data,
                    stream_id,
                    b"HTTP/1.0 200 OK\r\n\r\nhi".to_vec(),
                ))
                .await;
            relay
                .send_relay(RelayCell::new(
                    RelayCommand::End,
                    stream_id,
                    vec![EndReason::Done as u8],
                ))
                .await;
        };

        tokio::join!(client, relay_task);
        assert_eq!(mux.stats().streams_opened, 1);
        // The circuit stays open after a clean stream end
        assert_eq!(circuit.state(), CircuitState::Open);
    }

    /// A RELAY_END instead of CONNECTED surfaces the end reason; the
    /// circuit itself stays open.
    #[tokio::test]
    async fn test_open_refused_by_exit_policy() {
        let exit = test_relay("exit", 51, [10, 51, 0, 1]);
        let (circuit, relay_side) = open_circuit(exit);
        let mut relay = FakeRelaySide::new(relay_side, circuit.id());
        let mux = mux();

        let client = async {
            let result = mux
                .open_stream(&circuit, "example.com", 25, IsolationKey::None)
                .await;
            match result {
                Err(TorError::StreamEnd(reason)) => {
                    assert_eq!(reason, EndReason::ExitPolicy)
                }
                other => panic!("expected StreamEnd(ExitPolicy), got {:?}", other.err()),
            }
        };

        let relay_task = async {
            let begin = relay.recv_relay().await;
            assert_eq!(begin.command, RelayCommand::Begin);
            relay
                .send_relay(RelayCell::new(
                    RelayCommand::End,
                    begin.stream_id,
                    vec![EndReason::ExitPolicy as u8],
                ))
                .await;
        };

        tokio::join!(client, relay_task);
        assert_eq!(circuit.state(), CircuitState::Open);
        assert_eq!(mux.stats().streams_failed, 1);
    }

    /// RELAY_RESOLVE round trip over the reactor.
    #[tokio::test]
    async fn test_resolve_end_to_end() {
        let exit = test_relay("exit", 52, [10, 52, 0, 1]);
        let (circuit, relay_side) = open_circuit(exit);
        let mut relay = FakeRelaySide::new(relay_side, circuit.id());
        let mux = mux();

        let client = async {
            let addrs = mux.resolve(&circuit, "example.com").await.unwrap();
            assert_eq!(addrs.len(), 1);
            assert_eq!(addrs[0].addr, "93.184.216.34".parse::<IpAddr>().unwrap());
            assert_eq!(addrs[0].ttl, 600);
        };

        let relay_task = async {
            let resolve = relay.recv_relay().await;
            assert_eq!(resolve.command, RelayCommand::Resolve);
            assert_eq!(resolve.data, b"example.com\0".to_vec());

            let mut answer = vec![0x04, 4, 93, 184, 216, 34];
            answer.extend_from_slice(&600u32.to_be_bytes());
            relay
                .send_relay(RelayCell::new(
                    RelayCommand::Resolved,
                    resolve.stream_id,
                    answer,
                ))
                .await;
        };

        tokio::join!(client, relay_task);
    }

    #[test]
    fn test_parse_resolved_ipv4() {
        // 203.0.113.9 with TTL 300
        let mut data = vec![0x04, 4, 203, 0, 113, 9];
        data.extend_from_slice(&300u32.to_be_bytes());

        let answers = parse_resolved(&data).unwrap();
        assert_eq!(answers.len(), 1);
        match &answers[0] {
            ResolvedAnswer::Addr(resolved) => {
                assert_eq!(resolved.addr, "203.0.113.9".parse::<IpAddr>().unwrap());
                assert_eq!(resolved.ttl, 300);
            }
            _ => panic!("expected address answer"),
        }
    }

    #[test]
    fn test_parse_resolved_hostname_and_error() {
        let mut data = Vec::new();
        data.push(0x00);
        data.push(11);
        data.extend_from_slice(b"example.org");
        data.extend_from_slice(&60u32.to_be_bytes());
        data.push(0xF1);
        data.push(0);
        data.extend_from_slice(&0u32.to_be_bytes());

        let answers = parse_resolved(&data).unwrap();
        assert_eq!(answers.len(), 2);
        assert!(matches!(
            &answers[0],
            ResolvedAnswer::Hostname(name, 60) if name == "example.org"
        ));
        assert!(matches!(&answers[1], ResolvedAnswer::Error(false)));
    }

    #[test]
    fn test_parse_resolved_truncated() {
        let data = vec![0x04, 4, 203, 0]; // value cut short
        assert!(parse_resolved(&data).is_err());
    }

    #[test]
    fn test_ptr_query_names() {
        assert_eq!(
            ptr_query_name("1.2.3.4".parse().unwrap()),
            "4.3.2.1.in-addr.arpa"
        );
        let v6 = ptr_query_name("2001:db8::1".parse().unwrap());
        assert!(v6.ends_with("ip6.arpa"));
        assert!(v6.starts_with("1.0.0.0."));
    }
}
