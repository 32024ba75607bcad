//! Decoder for the tagged stream.

use std::collections::HashSet;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::cache::SharedCache;
use crate::error::{XCodecError, XCodecResult};
use crate::hash::segment_hash;
use crate::segment::{Segment, SEGMENT_LENGTH};
use crate::tags::{
    BACKREF_LEN, ESCAPE_CHAR, EXTRACT_LEN, OP_BACKREF, OP_ESCAPE, OP_EXTRACT, OP_REF, REF_LEN,
};
use crate::window::Window;

/// Decoder counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderStats {
    /// Tagged bytes consumed
    pub input_bytes: u64,
    /// Plaintext bytes produced
    pub output_bytes: u64,
    /// EXTRACT ops applied
    pub extracts: u64,
    /// REF ops resolved
    pub references: u64,
    /// BACKREF ops resolved
    pub backreferences: u64,
    /// Times decoding stalled on an unknown hash
    pub stalls: u64,
    /// Segments supplied through [`Decoder::learn`]
    pub learned: u64,
    /// Declarations that replaced different content under the same hash
    pub name_reuses: u64,
}

/// Stateful decoder bound to the namespace of the peer that encoded the stream.
pub struct Decoder {
    cache: SharedCache,
    window: Window,
    stats: DecoderStats,
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder")
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

fn read_hash(op: &[u8]) -> u64 {
    let mut raw = &op[2..10];
    raw.get_u64()
}

impl Decoder {
    /// Create a decoder over `cache`.
    pub fn new(cache: SharedCache) -> Self {
        Self {
            cache,
            window: Window::new(),
            stats: DecoderStats::default(),
        }
    }

    /// Counters since creation
    pub fn stats(&self) -> &DecoderStats {
        &self.stats
    }

    /// Decode as much of `input` as possible.
    ///
    /// Consumed bytes are removed from `input`; a trailing partial op stays.
    /// If a REF names a segment the cache does not hold, decoding stops in
    /// front of it and every unknown hash referenced from there on is pushed
    /// to `unresolved`. Call again after [`Decoder::learn`] has supplied them.
    pub fn decode(
        &mut self,
        output: &mut BytesMut,
        input: &mut BytesMut,
        unresolved: &mut Vec<u64>,
    ) -> XCodecResult<()> {
        let before_in = input.len();
        let before_out = output.len();
        let result = self.decode_ops(output, input, unresolved);
        self.stats.input_bytes += (before_in - input.len()) as u64;
        self.stats.output_bytes += (output.len() - before_out) as u64;
        result
    }

    fn decode_ops(
        &mut self,
        output: &mut BytesMut,
        input: &mut BytesMut,
        unresolved: &mut Vec<u64>,
    ) -> XCodecResult<()> {
        loop {
            let literal = input
                .iter()
                .position(|&b| b == ESCAPE_CHAR)
                .unwrap_or(input.len());
            if literal > 0 {
                output.put_slice(&input.split_to(literal));
            }
            if input.len() < 2 {
                return Ok(());
            }
            match input[1] {
                OP_ESCAPE => {
                    input.advance(2);
                    output.put_u8(ESCAPE_CHAR);
                }
                OP_EXTRACT => {
                    if input.len() < EXTRACT_LEN {
                        return Ok(());
                    }
                    let hash = read_hash(input);
                    let op = input.split_to(EXTRACT_LEN).freeze();
                    let segment = Segment::new(op.slice(10..))?;
                    if segment.hash() != hash {
                        return Err(XCodecError::corrupt(format!(
                            "EXTRACT names {:#018x} but its data hashes to {:#018x}",
                            hash,
                            segment.hash()
                        )));
                    }
                    self.enter(hash, segment.clone())?;
                    output.put_slice(segment.as_bytes());
                    self.window.declare(hash, segment);
                    self.stats.extracts += 1;
                }
                OP_REF => {
                    if input.len() < REF_LEN {
                        return Ok(());
                    }
                    let hash = read_hash(input);
                    match self.cache.lookup(hash)? {
                        Some(segment) => {
                            input.advance(REF_LEN);
                            output.put_slice(segment.as_bytes());
                            self.window.declare(hash, segment);
                            self.stats.references += 1;
                        }
                        None => {
                            unresolved.push(hash);
                            self.collect_unresolved(&input[REF_LEN..], unresolved)?;
                            self.stats.stalls += 1;
                            debug!(
                                hash = format_args!("{:#018x}", hash),
                                unresolved = unresolved.len(),
                                "decoder stalled on unknown segment"
                            );
                            return Ok(());
                        }
                    }
                }
                OP_BACKREF => {
                    if input.len() < BACKREF_LEN {
                        return Ok(());
                    }
                    let index = input[2];
                    let segment = self.window.dereference(index).ok_or_else(|| {
                        XCodecError::corrupt(format!("BACKREF to empty window slot {}", index))
                    })?;
                    output.put_slice(segment.as_bytes());
                    input.advance(BACKREF_LEN);
                    self.stats.backreferences += 1;
                }
                op => {
                    return Err(XCodecError::corrupt(format!(
                        "unknown op {:#04x} after escape",
                        op
                    )));
                }
            }
        }
    }

    /// Scan ahead of a stall for other unknown REF hashes without consuming.
    fn collect_unresolved(&self, mut rest: &[u8], unresolved: &mut Vec<u64>) -> XCodecResult<()> {
        let mut declared = HashSet::new();
        while let Some(at) = rest.iter().position(|&b| b == ESCAPE_CHAR) {
            rest = &rest[at..];
            if rest.len() < 2 {
                break;
            }
            let len = match rest[1] {
                OP_ESCAPE => 2,
                OP_BACKREF => BACKREF_LEN,
                OP_EXTRACT => {
                    if rest.len() < EXTRACT_LEN {
                        break;
                    }
                    declared.insert(read_hash(rest));
                    EXTRACT_LEN
                }
                OP_REF => {
                    if rest.len() < REF_LEN {
                        break;
                    }
                    let hash = read_hash(rest);
                    if !declared.contains(&hash)
                        && !unresolved.contains(&hash)
                        && self.cache.lookup(hash)?.is_none()
                    {
                        unresolved.push(hash);
                    }
                    REF_LEN
                }
                // decode reports it once it gets there
                _ => break,
            };
            if rest.len() < len {
                break;
            }
            rest = &rest[len..];
        }
        Ok(())
    }

    /// Supply a segment a stalled REF was waiting for.
    pub fn learn(&mut self, hash: u64, segment: Segment) -> XCodecResult<()> {
        if segment_hash(segment.as_bytes()) != hash {
            return Err(XCodecError::corrupt(format!(
                "learned segment does not hash to {:#018x}",
                hash
            )));
        }
        self.enter(hash, segment)?;
        self.stats.learned += 1;
        trace!(hash = format_args!("{:#018x}", hash), "learned segment");
        Ok(())
    }

    fn enter(&mut self, hash: u64, segment: Segment) -> XCodecResult<()> {
        if let Some(existing) = self.cache.lookup(hash)? {
            if existing == segment {
                return Ok(());
            }
            self.stats.name_reuses += 1;
            info!(
                hash = format_args!("{:#018x}", hash),
                "segment name reused with different content; replacing"
            );
        }
        debug_assert_eq!(segment.as_bytes().len(), SEGMENT_LENGTH);
        self.cache.enter(hash, segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::XCodecCache;
    use crate::encoder::Encoder;
    use crate::memory_cache::MemoryCache;
    use std::sync::Arc;

    fn block(seed: u8) -> Vec<u8> {
        (0..SEGMENT_LENGTH)
            .map(|i| (i as u8).wrapping_mul(seed | 1).wrapping_add(seed))
            .collect()
    }

    fn extract(data: &[u8]) -> Vec<u8> {
        let mut op = vec![ESCAPE_CHAR, OP_EXTRACT];
        op.extend_from_slice(&segment_hash(data).to_be_bytes());
        op.extend_from_slice(data);
        op
    }

    fn reference(hash: u64) -> Vec<u8> {
        let mut op = vec![ESCAPE_CHAR, OP_REF];
        op.extend_from_slice(&hash.to_be_bytes());
        op
    }

    fn decoder() -> (Arc<MemoryCache>, Decoder) {
        let cache = Arc::new(MemoryCache::unbounded());
        let decoder = Decoder::new(cache.clone());
        (cache, decoder)
    }

    fn decode_all(dec: &mut Decoder, stream: &[u8]) -> XCodecResult<(Vec<u8>, BytesMut, Vec<u64>)> {
        let mut input = BytesMut::from(stream);
        let mut output = BytesMut::new();
        let mut unresolved = Vec::new();
        dec.decode(&mut output, &mut input, &mut unresolved)?;
        Ok((output.to_vec(), input, unresolved))
    }

    #[test]
    fn literals_and_escapes() {
        let (_, mut dec) = decoder();
        let (out, rest, unresolved) =
            decode_all(&mut dec, &[7, ESCAPE_CHAR, OP_ESCAPE, 9]).unwrap();
        assert_eq!(out, vec![7, ESCAPE_CHAR, 9]);
        assert!(rest.is_empty());
        assert!(unresolved.is_empty());
    }

    #[test]
    fn extract_then_backref() {
        let (cache, mut dec) = decoder();
        let a = block(3);
        let mut stream = extract(&a);
        stream.extend_from_slice(&[ESCAPE_CHAR, OP_BACKREF, 0]);
        let (out, rest, _) = decode_all(&mut dec, &stream).unwrap();
        assert_eq!(out, [a.clone(), a.clone()].concat());
        assert!(rest.is_empty());
        assert!(cache.contains(segment_hash(&a)));
    }

    #[test]
    fn extract_with_wrong_hash_is_corrupt() {
        let (_, mut dec) = decoder();
        let mut stream = extract(&block(3));
        stream[9] ^= 1;
        assert!(matches!(
            decode_all(&mut dec, &stream),
            Err(XCodecError::CorruptStream { .. })
        ));
    }

    #[test]
    fn backref_to_empty_slot_is_corrupt() {
        let (_, mut dec) = decoder();
        assert!(matches!(
            decode_all(&mut dec, &[ESCAPE_CHAR, OP_BACKREF, 4]),
            Err(XCodecError::CorruptStream { .. })
        ));
    }

    #[test]
    fn unknown_op_is_corrupt() {
        let (_, mut dec) = decoder();
        assert!(matches!(
            decode_all(&mut dec, &[1, ESCAPE_CHAR, 0x7f]),
            Err(XCodecError::CorruptStream { .. })
        ));
    }

    #[test]
    fn partial_op_stays_in_input() {
        let (_, mut dec) = decoder();
        let stream = extract(&block(5));
        let (out, rest, _) = decode_all(&mut dec, &stream[..100]).unwrap();
        assert!(out.is_empty());
        assert_eq!(rest.len(), 100);

        let (out, rest, _) = decode_all(&mut dec, &[4, ESCAPE_CHAR]).unwrap();
        assert_eq!(out, vec![4]);
        assert_eq!(&rest[..], &[ESCAPE_CHAR]);
    }

    #[test]
    fn ref_miss_stalls_and_batches_lookahead() {
        let (_, mut dec) = decoder();
        let a = block(1);
        let b = block(2);
        let c = block(4);
        let mut stream = vec![42];
        stream.extend(reference(segment_hash(&a)));
        stream.extend(extract(&c));
        stream.extend(reference(segment_hash(&b)));
        stream.extend(reference(segment_hash(&c)));
        stream.extend(reference(segment_hash(&a)));

        let (out, rest, unresolved) = decode_all(&mut dec, &stream).unwrap();
        assert_eq!(out, vec![42]);
        assert_eq!(rest.len(), stream.len() - 1);
        assert_eq!(unresolved, vec![segment_hash(&a), segment_hash(&b)]);

        dec.learn(segment_hash(&a), Segment::from_slice(&a).unwrap())
            .unwrap();
        dec.learn(segment_hash(&b), Segment::from_slice(&b).unwrap())
            .unwrap();
        let mut input = rest;
        let mut output = BytesMut::new();
        let mut unresolved = Vec::new();
        dec.decode(&mut output, &mut input, &mut unresolved).unwrap();
        assert!(unresolved.is_empty());
        assert!(input.is_empty());
        assert_eq!(&output[..], &[a.clone(), c, b, block(4), a].concat()[..]);
    }

    #[test]
    fn learn_rejects_mismatched_segment() {
        let (_, mut dec) = decoder();
        let a = Segment::from_slice(&block(1)).unwrap();
        assert!(dec.learn(a.hash() ^ 1, a).is_err());
    }

    #[test]
    fn name_reuse_replaces_entry() {
        let (cache, mut dec) = decoder();
        let a = Segment::from_slice(&block(1)).unwrap();
        let other = Segment::from_slice(&block(2)).unwrap();
        cache.enter(a.hash(), other).unwrap();
        let (out, _, _) = decode_all(&mut dec, &extract(a.as_bytes())).unwrap();
        assert_eq!(out, a.as_bytes());
        assert_eq!(cache.lookup(a.hash()).unwrap(), Some(a));
        assert_eq!(dec.stats().name_reuses, 1);
    }

    #[test]
    fn decodes_encoder_output() {
        let cache: SharedCache = Arc::new(MemoryCache::unbounded());
        let mut enc = Encoder::new(cache.clone());
        let mut dec = Decoder::new(cache);
        let input = [block(1), vec![ESCAPE_CHAR; 5], block(2), block(1), block(2)].concat();
        let mut wire = BytesMut::new();
        enc.encode(&mut wire, &input, None).unwrap();
        let mut out = BytesMut::new();
        let mut unresolved = Vec::new();
        dec.decode(&mut out, &mut wire, &mut unresolved).unwrap();
        assert!(unresolved.is_empty());
        assert!(wire.is_empty());
        assert_eq!(&out[..], &input[..]);
    }
}
