//! Bidirectional XCodec pipe: one encoder, one decoder, one wire.
//!
//! [`PipePair`] is sans-IO. Callers push plaintext and wire bytes in and
//! drain the two [`PipeOutput`] buffers; [`crate::session::run_session`]
//! drives it over tokio streams.
//!
//! Sending side: plaintext is cut into frames of `frame_plaintext_len`
//! bytes, each encoded with a fresh [`ReferenceFrame`] that is kept until the
//! peer's ADVANCE covers it, so that ASKs can always be answered.
//!
//! Receiving side: FRAMEs are decoded in order. When the decoder stalls on
//! unknown hashes they are sent as ASKs and decoding resumes once every ASK
//! of the round has been answered by a LEARN.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};
use uuid::Uuid;
use wanproxy_xcodec::{
    CacheRegistry, Decoder, DecoderStats, Encoder, EncoderStats, ReferenceFrame,
};

use crate::config::PipePairConfig;
use crate::error::{Result, TransportError};
use crate::frames::ReferenceFrames;
use crate::protocol::{Message, MAX_FRAME_LENGTH};

/// Progress of the sending direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncoderState {
    /// HELLO queued, no data yet
    HelloSent,
    /// At least one FRAME sent
    Streaming,
    /// EOS sent, waiting for EOS_ACK
    EosSent,
    /// Peer acknowledged our EOS
    EosAcked,
}

/// Progress of the receiving direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecoderState {
    /// Waiting for the peer's HELLO
    Uninitialized,
    /// Peer identified, no FRAME yet
    HelloReceived,
    /// At least one FRAME received
    Streaming,
    /// Peer sent EOS; draining queued frames
    EosReceived,
    /// Everything decoded and EOS_ACK sent
    EosAckSent,
}

/// Output buffer of one direction, plus its end-of-stream flag.
#[derive(Debug, Default)]
pub struct PipeOutput {
    buf: BytesMut,
    total: u64,
    eos: bool,
}

impl PipeOutput {
    /// Take everything buffered so far.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Bytes waiting to be taken
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if nothing is waiting
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// True once no more bytes will ever be produced
    pub fn is_eos(&self) -> bool {
        self.eos
    }

    /// Bytes produced since creation
    pub fn total(&self) -> u64 {
        self.total
    }

    fn push(&mut self, message: &Message) {
        let before = self.buf.len();
        message.encode(&mut self.buf);
        self.total += (self.buf.len() - before) as u64;
    }
}

/// Counters of one pipe pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipePairStats {
    /// Plaintext bytes accepted for encoding
    pub plaintext_in: u64,
    /// Plaintext bytes produced by decoding
    pub plaintext_out: u64,
    /// Wire bytes received
    pub wire_in: u64,
    /// Wire bytes produced
    pub wire_out: u64,
    /// FRAMEs sent
    pub frames_sent: u64,
    /// FRAMEs received
    pub frames_received: u64,
    /// ASKs sent
    pub asks_sent: u64,
    /// ASKs answered
    pub asks_received: u64,
    /// LEARNs sent
    pub learns_sent: u64,
    /// LEARNs received
    pub learns_received: u64,
    /// ADVANCEs sent
    pub advances_sent: u64,
    /// ADVANCEs received
    pub advances_received: u64,
    /// Reference frames not yet acknowledged
    pub outstanding_frames: usize,
    /// Sending-side codec counters
    pub encoder: EncoderStats,
    /// Receiving-side codec counters
    pub decoder: DecoderStats,
}

/// One end of an XCodec connection.
pub struct PipePair {
    config: PipePairConfig,
    registry: Arc<CacheRegistry>,
    local_uuid: Uuid,
    peer_uuid: Option<Uuid>,
    encoder: Option<Encoder>,
    decoder: Option<Decoder>,
    encoder_state: EncoderState,
    decoder_state: DecoderState,
    frames: ReferenceFrames,
    wire_in: BytesMut,
    /// FRAME payloads not yet fully decoded, oldest first
    inbound: VecDeque<BytesMut>,
    /// hashes of each ASK of the current round, in send order
    asks: VecDeque<Vec<u64>>,
    /// frames decoded since the last ADVANCE
    unadvanced: u32,
    wire_out: PipeOutput,
    plaintext_out: PipeOutput,
    closed: bool,
    stats: PipePairStats,
}

impl std::fmt::Debug for PipePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipePair")
            .field("local_uuid", &self.local_uuid)
            .field("peer_uuid", &self.peer_uuid)
            .field("encoder_state", &self.encoder_state)
            .field("decoder_state", &self.decoder_state)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Drop for PipePair {
    fn drop(&mut self) {
        if !self.closed {
            self.decoder = None;
            self.release_peer();
        }
    }
}

impl PipePair {
    /// Create a pipe whose encoder uses the registry's local namespace.
    ///
    /// HELLO is queued on the wire output immediately.
    pub fn new(registry: Arc<CacheRegistry>, config: PipePairConfig) -> Result<Self> {
        config.validate()?;
        let local_uuid = registry.local_uuid();
        let encoder = Encoder::new(registry.local()?);
        let mut pair = Self {
            config,
            registry,
            local_uuid,
            peer_uuid: None,
            encoder: Some(encoder),
            decoder: None,
            encoder_state: EncoderState::HelloSent,
            decoder_state: DecoderState::Uninitialized,
            frames: ReferenceFrames::new(),
            wire_in: BytesMut::new(),
            inbound: VecDeque::new(),
            asks: VecDeque::new(),
            unadvanced: 0,
            wire_out: PipeOutput::default(),
            plaintext_out: PipeOutput::default(),
            closed: false,
            stats: PipePairStats::default(),
        };
        pair.wire_out.push(&Message::Hello(local_uuid));
        debug!(local_uuid = %local_uuid, "pipe pair created; HELLO queued");
        Ok(pair)
    }

    /// Identity announced in our HELLO
    pub fn local_uuid(&self) -> Uuid {
        self.local_uuid
    }

    /// Identity from the peer's HELLO, once received
    pub fn peer_uuid(&self) -> Option<Uuid> {
        self.peer_uuid
    }

    /// Sending-direction state
    pub fn encoder_state(&self) -> EncoderState {
        self.encoder_state
    }

    /// Receiving-direction state
    pub fn decoder_state(&self) -> DecoderState {
        self.decoder_state
    }

    /// True after an error or [`PipePair::close`]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Encode plaintext; an empty slice means end of stream.
    pub fn consume_plaintext(&mut self, data: &[u8]) -> Result<()> {
        self.check_open()?;
        let result = self.encode_plaintext(data);
        self.guard(result)
    }

    /// Process bytes from the peer; an empty slice means the wire closed.
    pub fn consume_wire(&mut self, data: &[u8]) -> Result<()> {
        self.check_open()?;
        let result = self.receive_wire(data);
        self.guard(result)
    }

    /// Take pending wire bytes
    pub fn take_wire_output(&mut self) -> Bytes {
        self.wire_out.take()
    }

    /// Take pending decoded plaintext
    pub fn take_plaintext_output(&mut self) -> Bytes {
        self.plaintext_out.take()
    }

    /// Wire output buffer
    pub fn wire_output(&self) -> &PipeOutput {
        &self.wire_out
    }

    /// Plaintext output buffer
    pub fn plaintext_output(&self) -> &PipeOutput {
        &self.plaintext_out
    }

    /// True once both EOS handshakes are done; the wire can be shut down.
    pub fn wire_eos(&self) -> bool {
        self.wire_out.eos
    }

    /// True once the peer's stream has been fully decoded.
    pub fn plaintext_eos(&self) -> bool {
        self.plaintext_out.eos
    }

    /// True when both directions have ended
    pub fn is_finished(&self) -> bool {
        self.wire_eos() && self.plaintext_eos()
    }

    /// Counters snapshot
    pub fn stats(&self) -> PipePairStats {
        let mut stats = self.stats.clone();
        stats.wire_out = self.wire_out.total;
        stats.plaintext_out = self.plaintext_out.total;
        stats.outstanding_frames = self.frames.len();
        if let Some(encoder) = &self.encoder {
            stats.encoder = encoder.stats().clone();
        }
        if let Some(decoder) = &self.decoder {
            stats.decoder = decoder.stats().clone();
        }
        stats
    }

    /// Release every reference frame, pending ASK, buffered frame and cache
    /// handle. Later calls fail with [`TransportError::Closed`].
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.stats = self.stats();
        self.closed = true;
        self.frames.clear();
        self.inbound.clear();
        self.asks.clear();
        self.wire_in.clear();
        self.wire_out.buf.clear();
        self.plaintext_out.buf.clear();
        self.encoder = None;
        self.decoder = None;
        self.release_peer();
        debug!(local_uuid = %self.local_uuid, peer_uuid = ?self.peer_uuid, "pipe pair closed");
    }

    /// Let a disk store collect the peer's namespace once it is idle.
    fn release_peer(&self) {
        if let Some(peer) = self.peer_uuid {
            self.registry.release(peer);
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn guard(&mut self, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            error!(
                error = %e,
                local_uuid = %self.local_uuid,
                peer_uuid = ?self.peer_uuid,
                "pipe pair failed"
            );
            self.close();
        }
        result
    }

    fn encode_plaintext(&mut self, data: &[u8]) -> Result<()> {
        let finished = matches!(self.encoder_state, EncoderState::EosSent | EncoderState::EosAcked);
        if data.is_empty() {
            if !finished {
                self.wire_out.push(&Message::Eos);
                self.encoder_state = EncoderState::EosSent;
                debug!(outstanding = self.frames.len(), "EOS sent");
            }
            return Ok(());
        }
        if finished {
            return Err(TransportError::InvalidState {
                reason: "plaintext after end of stream".into(),
            });
        }
        let encoder = self.encoder.as_mut().ok_or(TransportError::Closed)?;
        self.encoder_state = EncoderState::Streaming;
        self.stats.plaintext_in += data.len() as u64;
        for chunk in data.chunks(self.config.frame_plaintext_len) {
            let mut frame = ReferenceFrame::new();
            let mut payload = BytesMut::with_capacity(chunk.len() + 64);
            encoder.encode(&mut payload, chunk, Some(&mut frame))?;
            debug_assert!(payload.len() <= MAX_FRAME_LENGTH as usize);
            trace!(plaintext = chunk.len(), encoded = payload.len(), segments = frame.len(), "FRAME");
            self.frames.push(frame);
            self.wire_out.push(&Message::Frame(payload));
            self.stats.frames_sent += 1;
        }
        Ok(())
    }

    fn receive_wire(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return self.wire_closed();
        }
        self.stats.wire_in += data.len() as u64;
        self.wire_in.extend_from_slice(data);
        while let Some(message) = Message::parse(&mut self.wire_in)? {
            self.handle(message)?;
        }
        self.pump()?;
        self.flush_advance();
        if self.encoder_state == EncoderState::EosAcked
            && self.decoder_state == DecoderState::EosAckSent
            && !self.wire_out.eos
        {
            self.wire_out.eos = true;
            debug!(peer_uuid = ?self.peer_uuid, "both directions acknowledged; wire may close");
        }
        Ok(())
    }

    fn wire_closed(&mut self) -> Result<()> {
        if !self.wire_in.is_empty() {
            return Err(TransportError::UnexpectedEof {
                reason: format!("{} bytes of a partial message", self.wire_in.len()),
            });
        }
        if self.encoder_state != EncoderState::EosAcked {
            return Err(TransportError::UnexpectedEof {
                reason: "our EOS was never acknowledged".into(),
            });
        }
        if self.decoder_state != DecoderState::EosAckSent {
            return Err(TransportError::UnexpectedEof {
                reason: "peer never finished its stream".into(),
            });
        }
        Ok(())
    }

    fn handle(&mut self, message: Message) -> Result<()> {
        if self.peer_uuid.is_none() && !matches!(message, Message::Hello(_)) {
            return Err(TransportError::violation(format!(
                "{:?} before HELLO",
                message.opcode()
            )));
        }
        match message {
            Message::Hello(uuid) => {
                if let Some(peer) = self.peer_uuid {
                    return Err(TransportError::violation(format!(
                        "duplicate HELLO ({} after {})",
                        uuid, peer
                    )));
                }
                if uuid.is_nil() {
                    return Err(TransportError::violation("HELLO with nil UUID"));
                }
                let cache = self.registry.connect(uuid)?;
                self.decoder = Some(Decoder::new(cache));
                self.peer_uuid = Some(uuid);
                self.decoder_state = DecoderState::HelloReceived;
                debug!(peer_uuid = %uuid, "peer HELLO received");
            }
            Message::Frame(payload) => {
                if matches!(self.decoder_state, DecoderState::EosReceived | DecoderState::EosAckSent) {
                    return Err(TransportError::violation("FRAME after EOS"));
                }
                self.decoder_state = DecoderState::Streaming;
                self.inbound.push_back(payload);
                self.stats.frames_received += 1;
            }
            Message::Learn(segments) => {
                let Some(asked) = self.asks.pop_front() else {
                    return Err(TransportError::violation("unsolicited LEARN"));
                };
                if segments.len() != asked.len() {
                    return Err(TransportError::violation(format!(
                        "LEARN of {} segments for an ASK of {}",
                        segments.len(),
                        asked.len()
                    )));
                }
                let decoder = self.decoder.as_mut().ok_or(TransportError::Closed)?;
                for (hash, segment) in asked.into_iter().zip(segments) {
                    if segment.hash() != hash {
                        return Err(TransportError::violation(format!(
                            "LEARN answer for {:#018x} hashes to {:#018x}",
                            hash,
                            segment.hash()
                        )));
                    }
                    decoder.learn(hash, segment)?;
                }
                self.stats.learns_received += 1;
            }
            Message::Ask(hashes) => {
                let segments = hashes
                    .iter()
                    .map(|&hash| {
                        self.frames.find(hash).cloned().ok_or_else(|| {
                            TransportError::violation(format!(
                                "ASK for {:#018x}, which no outstanding frame references",
                                hash
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                trace!(count = segments.len(), "answering ASK");
                self.wire_out.push(&Message::Learn(segments));
                self.stats.asks_received += 1;
                self.stats.learns_sent += 1;
            }
            Message::Eos => {
                if matches!(self.decoder_state, DecoderState::EosReceived | DecoderState::EosAckSent) {
                    return Err(TransportError::violation("duplicate EOS"));
                }
                self.decoder_state = DecoderState::EosReceived;
                debug!(queued = self.inbound.len(), "peer EOS received");
            }
            Message::EosAck => {
                if self.encoder_state != EncoderState::EosSent {
                    return Err(TransportError::violation(format!(
                        "EOS_ACK while {:?}",
                        self.encoder_state
                    )));
                }
                self.encoder_state = EncoderState::EosAcked;
                self.frames.clear();
                debug!("EOS acknowledged by peer");
            }
            Message::Advance(count) => {
                self.frames.advance(count as usize)?;
                self.stats.advances_received += 1;
            }
        }
        Ok(())
    }

    /// Decode queued frames until they run out or an ASK round is pending.
    fn pump(&mut self) -> Result<()> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(());
        };
        let before = self.plaintext_out.buf.len();
        while self.asks.is_empty() {
            let Some(front) = self.inbound.front_mut() else {
                break;
            };
            let mut unresolved = Vec::new();
            decoder.decode(&mut self.plaintext_out.buf, front, &mut unresolved)?;
            if front.is_empty() {
                self.inbound.pop_front();
                self.unadvanced += 1;
                continue;
            }
            if unresolved.is_empty() {
                return Err(TransportError::violation("FRAME ends inside a tagged op"));
            }
            for batch in unresolved.chunks(self.config.max_ask_hashes) {
                self.wire_out.push(&Message::Ask(batch.to_vec()));
                self.asks.push_back(batch.to_vec());
                self.stats.asks_sent += 1;
            }
            debug!(
                hashes = unresolved.len(),
                asks = self.asks.len(),
                "decoder stalled; asking peer"
            );
        }
        self.plaintext_out.total += (self.plaintext_out.buf.len() - before) as u64;

        if self.decoder_state == DecoderState::EosReceived
            && self.inbound.is_empty()
            && self.asks.is_empty()
        {
            self.flush_advance();
            self.plaintext_out.eos = true;
            self.wire_out.push(&Message::EosAck);
            self.decoder_state = DecoderState::EosAckSent;
            debug!("peer stream fully decoded; EOS_ACK sent");
        }
        Ok(())
    }

    fn flush_advance(&mut self) {
        if self.unadvanced > 0 {
            self.wire_out.push(&Message::Advance(self.unadvanced));
            self.stats.advances_sent += 1;
            self.unadvanced = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Opcode;
    use wanproxy_xcodec::{CacheConfig, Segment, XCodecCache, SEGMENT_LENGTH};

    fn registry(id: u128) -> Arc<CacheRegistry> {
        Arc::new(
            CacheRegistry::new(CacheConfig::Memory { max_entries: None }, Uuid::from_u128(id))
                .unwrap(),
        )
    }

    fn small_frames() -> PipePairConfig {
        PipePairConfig {
            frame_plaintext_len: 4096,
            ..Default::default()
        }
    }

    fn pair(id: u128) -> PipePair {
        PipePair::new(registry(id), small_frames()).unwrap()
    }

    fn noise(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 32) as u8
            })
            .collect()
    }

    fn repetitive() -> Vec<u8> {
        let a = noise(SEGMENT_LENGTH, 1);
        let b = noise(SEGMENT_LENGTH, 2);
        let gap = noise(300, 3);
        [a.clone(), gap.clone(), b.clone(), a.clone(), gap, b, a].concat()
    }

    /// Move wire bytes both ways until neither side has anything to say.
    fn shuttle(a: &mut PipePair, b: &mut PipePair) -> Result<()> {
        for _ in 0..1000 {
            let from_a = a.take_wire_output();
            let from_b = b.take_wire_output();
            if from_a.is_empty() && from_b.is_empty() {
                return Ok(());
            }
            if !from_a.is_empty() {
                b.consume_wire(&from_a)?;
            }
            if !from_b.is_empty() {
                a.consume_wire(&from_b)?;
            }
        }
        panic!("pipes never went quiet");
    }

    fn transfer(a: &mut PipePair, b: &mut PipePair, data: &[u8]) -> Vec<u8> {
        a.consume_plaintext(data).unwrap();
        a.consume_plaintext(&[]).unwrap();
        b.consume_plaintext(&[]).unwrap();
        shuttle(a, b).unwrap();
        b.take_plaintext_output().to_vec()
    }

    fn message(m: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        m.encode(&mut buf);
        buf
    }

    #[test]
    fn test_hello_queued_on_creation() {
        let mut a = pair(1);
        let wire = a.take_wire_output();
        assert_eq!(wire[0], Opcode::Hello as u8);
        assert_eq!(&wire[2..18], Uuid::from_u128(1).as_bytes());
        assert_eq!(a.encoder_state(), EncoderState::HelloSent);
    }

    #[test]
    fn test_full_transfer_and_shutdown() {
        let mut a = pair(1);
        let mut b = pair(2);
        let data = repetitive();
        let out = transfer(&mut a, &mut b, &data);
        assert_eq!(out, data);

        assert!(a.is_finished());
        assert!(b.is_finished());
        assert!(a.plaintext_output().is_empty());
        a.consume_wire(&[]).unwrap();
        b.consume_wire(&[]).unwrap();
        assert_eq!(a.stats().outstanding_frames, 0);
        assert_eq!(b.peer_uuid(), Some(Uuid::from_u128(1)));
    }

    #[test]
    fn test_both_directions_at_once() {
        let mut a = pair(1);
        let mut b = pair(2);
        let ab = repetitive();
        let ba = noise(10_000, 9);
        a.consume_plaintext(&ab).unwrap();
        b.consume_plaintext(&ba).unwrap();
        a.consume_plaintext(&[]).unwrap();
        b.consume_plaintext(&[]).unwrap();
        shuttle(&mut a, &mut b).unwrap();
        assert_eq!(b.take_plaintext_output().to_vec(), ab);
        assert_eq!(a.take_plaintext_output().to_vec(), ba);
        assert!(a.is_finished() && b.is_finished());
    }

    #[test]
    fn test_advance_releases_frames() {
        let mut a = pair(1);
        let mut b = pair(2);
        a.consume_plaintext(&repetitive()).unwrap();
        assert!(a.stats().outstanding_frames > 1);
        shuttle(&mut a, &mut b).unwrap();
        assert_eq!(a.stats().outstanding_frames, 0);
        assert!(b.stats().advances_sent >= 1);
        assert!(!a.wire_eos());
    }

    #[test]
    fn test_ask_learn_for_segment_peer_lacks() {
        let reg_a = registry(1);
        let known = Segment::from_slice(&noise(SEGMENT_LENGTH, 42)).unwrap();
        reg_a.local().unwrap().enter(known.hash(), known.clone()).unwrap();

        let mut a = PipePair::new(reg_a, small_frames()).unwrap();
        let mut b = pair(2);
        let data = [noise(100, 5), known.as_bytes().to_vec(), noise(100, 6)].concat();
        let out = transfer(&mut a, &mut b, &data);
        assert_eq!(out, data);
        assert_eq!(b.stats().asks_sent, 1);
        assert_eq!(a.stats().learns_sent, 1);
        assert_eq!(b.stats().decoder.learned, 1);
    }

    #[test]
    fn test_second_connection_reuses_peer_namespace() {
        let reg_a = registry(1);
        let reg_b = registry(2);
        let data = noise(4 * SEGMENT_LENGTH, 11);

        let mut a = PipePair::new(reg_a.clone(), PipePairConfig::default()).unwrap();
        let mut b = PipePair::new(reg_b.clone(), PipePairConfig::default()).unwrap();
        assert_eq!(transfer(&mut a, &mut b, &data), data);
        let first_wire = a.stats().wire_out;

        let mut a = PipePair::new(reg_a, PipePairConfig::default()).unwrap();
        let mut b = PipePair::new(reg_b, PipePairConfig::default()).unwrap();
        assert_eq!(transfer(&mut a, &mut b, &data), data);
        assert!(a.stats().encoder.references >= 1);
        assert!(a.stats().wire_out < first_wire / 2);
        assert_eq!(b.stats().asks_sent, 0);
    }

    #[test]
    fn test_ask_batches_are_bounded() {
        let reg_a = registry(1);
        let local = reg_a.local().unwrap();
        let mut data = Vec::new();
        for seed in 0..5 {
            let seg = Segment::from_slice(&noise(SEGMENT_LENGTH, 100 + seed)).unwrap();
            local.enter(seg.hash(), seg.clone()).unwrap();
            data.extend_from_slice(seg.as_bytes());
        }
        let config = PipePairConfig {
            frame_plaintext_len: 32 * 1024,
            max_ask_hashes: 2,
        };
        let mut a = PipePair::new(reg_a, config.clone()).unwrap();
        let mut b = PipePair::new(registry(2), config).unwrap();
        assert_eq!(transfer(&mut a, &mut b, &data), data);
        assert_eq!(b.stats().asks_sent, 3);
        assert_eq!(a.stats().learns_sent, 3);
    }

    #[test]
    fn test_duplicate_hello_is_violation() {
        let mut a = pair(1);
        let mut b = pair(2);
        let hello = a.take_wire_output();
        b.consume_wire(&hello).unwrap();
        let err = b.consume_wire(&hello).unwrap_err();
        assert!(matches!(err, TransportError::ProtocolViolation { .. }));
        assert!(b.is_closed());
        assert!(matches!(
            b.consume_plaintext(b"more"),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn test_frame_before_hello_is_violation() {
        let mut b = pair(2);
        let frame = message(Message::Frame(BytesMut::from(&b"x"[..])));
        assert!(matches!(
            b.consume_wire(&frame),
            Err(TransportError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_ask_for_unknown_hash_is_violation() {
        let mut a = pair(1);
        let mut b = pair(2);
        a.consume_wire(&b.take_wire_output()).unwrap();
        let ask = message(Message::Ask(vec![0x1234]));
        assert!(a.consume_wire(&ask).is_err());
        assert!(a.is_closed());
        assert_eq!(a.stats().outstanding_frames, 0);
    }

    #[test]
    fn test_advance_beyond_backlog_is_violation() {
        let mut a = pair(1);
        let mut b = pair(2);
        a.consume_wire(&b.take_wire_output()).unwrap();
        a.consume_plaintext(b"one frame").unwrap();
        assert!(a.consume_wire(&message(Message::Advance(2))).is_err());
    }

    #[test]
    fn test_eos_ack_before_eos_is_violation() {
        let mut a = pair(1);
        let mut b = pair(2);
        a.consume_wire(&b.take_wire_output()).unwrap();
        assert!(a.consume_wire(&message(Message::EosAck)).is_err());
    }

    #[test]
    fn test_unsolicited_learn_is_violation() {
        let mut a = pair(1);
        let mut b = pair(2);
        a.consume_wire(&b.take_wire_output()).unwrap();
        let seg = Segment::from_slice(&[9u8; SEGMENT_LENGTH]).unwrap();
        assert!(a.consume_wire(&message(Message::Learn(vec![seg]))).is_err());
    }

    #[test]
    fn test_frame_after_eos_is_violation() {
        let mut a = pair(1);
        let mut b = pair(2);
        let mut wire = b.take_wire_output().to_vec();
        wire.extend_from_slice(&message(Message::Eos));
        a.consume_wire(&wire).unwrap();
        let frame = message(Message::Frame(BytesMut::from(&b"late"[..])));
        assert!(a.consume_wire(&frame).is_err());
    }

    #[test]
    fn test_wire_closed_early_is_error() {
        let mut a = pair(1);
        let mut b = pair(2);
        a.consume_wire(&b.take_wire_output()).unwrap();
        assert!(matches!(
            a.consume_wire(&[]),
            Err(TransportError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn test_plaintext_after_eos_is_rejected() {
        let mut a = pair(1);
        a.consume_plaintext(&[]).unwrap();
        a.consume_plaintext(&[]).unwrap();
        assert!(matches!(
            a.consume_plaintext(b"late"),
            Err(TransportError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_close_releases_state() {
        let mut a = pair(1);
        a.consume_plaintext(&repetitive()).unwrap();
        assert!(a.stats().outstanding_frames > 0);
        a.close();
        assert_eq!(a.stats().outstanding_frames, 0);
        assert!(a.take_wire_output().is_empty());
        assert!(matches!(a.consume_wire(b"x"), Err(TransportError::Closed)));
    }

    #[test]
    fn test_finished_peers_free_disk_namespaces() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::Disk {
            path: dir.path().join("peers.xcd"),
            size_bytes: 2 << 20,
        };
        let disk = Arc::new(CacheRegistry::new(config, Uuid::from_u128(1)).unwrap());
        let max = wanproxy_xcodec::layout::MAX_NAMESPACES as u128;
        for i in 0..max + 16 {
            let mut hello = BytesMut::new();
            Message::Hello(Uuid::from_u128(0x1000 + i)).encode(&mut hello);
            let mut p = PipePair::new(disk.clone(), PipePairConfig::default()).unwrap();
            p.consume_wire(&hello).unwrap();
            if i % 2 == 0 {
                p.close();
            }
        }
    }

    #[test]
    fn test_finished_peer_keeps_memory_namespace() {
        let memory = registry(1);
        let peer = Uuid::from_u128(9);
        let segment = Segment::from_slice(&noise(SEGMENT_LENGTH, 4)).unwrap();
        let mut hello = BytesMut::new();
        Message::Hello(peer).encode(&mut hello);

        let mut p = PipePair::new(memory.clone(), PipePairConfig::default()).unwrap();
        p.consume_wire(&hello).unwrap();
        memory.connect(peer).unwrap().enter(11, segment.clone()).unwrap();
        drop(p);
        assert_eq!(memory.connect(peer).unwrap().lookup(11).unwrap(), Some(segment));
    }
}
