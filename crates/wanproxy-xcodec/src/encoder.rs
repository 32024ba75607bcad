//! Rolling-hash encoder producing the tagged stream.
//!
//! Every `SEGMENT_LENGTH`-byte window of the input is hashed. Windows already
//! known to the dictionary become references; the first unknown window of a
//! run is kept as a candidate and declared once scanning has moved past it.
//! Everything else is copied through as escaped literals.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::cache::SharedCache;
use crate::error::XCodecResult;
use crate::hash::RollingHash;
use crate::reference::ReferenceFrame;
use crate::segment::{Segment, SEGMENT_LENGTH};
use crate::tags::{escape_into, ESCAPE_CHAR, OP_BACKREF, OP_EXTRACT, OP_REF};
use crate::window::Window;

/// Encoder counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderStats {
    /// Plaintext bytes consumed
    pub input_bytes: u64,
    /// Tagged bytes produced
    pub output_bytes: u64,
    /// Plaintext bytes passed through as literals
    pub literal_bytes: u64,
    /// Segments newly declared
    pub declarations: u64,
    /// REF ops emitted for known segments
    pub references: u64,
    /// BACKREF ops emitted
    pub backreferences: u64,
    /// Windows whose hash matched but content did not
    pub collisions: u64,
}

enum Lookup {
    Window(u8, Segment),
    Cache(Segment),
    Collision,
    Miss,
}

/// Stateful encoder bound to one dictionary namespace.
///
/// The back-reference window persists across calls and must stay in lockstep
/// with the decoder reading this stream.
pub struct Encoder {
    cache: SharedCache,
    window: Window,
    out_of_band: bool,
    stats: EncoderStats,
}

impl std::fmt::Debug for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoder")
            .field("out_of_band", &self.out_of_band)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Encoder {
    /// Create an encoder over `cache`; its delivery mode is fixed here.
    pub fn new(cache: SharedCache) -> Self {
        let out_of_band = cache.out_of_band();
        Self {
            cache,
            window: Window::new(),
            out_of_band,
            stats: EncoderStats::default(),
        }
    }

    /// True if declarations are sent as REF rather than EXTRACT.
    pub fn out_of_band(&self) -> bool {
        self.out_of_band
    }

    /// Counters since creation
    pub fn stats(&self) -> &EncoderStats {
        &self.stats
    }

    /// Encode all of `input`, appending the tagged stream to `output`.
    ///
    /// Every segment declared or referenced is recorded in `frame` if given.
    pub fn encode(
        &mut self,
        output: &mut BytesMut,
        input: &[u8],
        mut frame: Option<&mut ReferenceFrame>,
    ) -> XCodecResult<()> {
        let before = output.len();
        self.stats.input_bytes += input.len() as u64;

        if input.len() < SEGMENT_LENGTH {
            self.literals(output, input);
            self.stats.output_bytes += (output.len() - before) as u64;
            return Ok(());
        }

        let mut hash = RollingHash::new();
        let mut fill = 0usize;
        // first input byte not yet written to output
        let mut base = 0usize;
        let mut candidate: Option<(usize, u64)> = None;

        for pos in 0..input.len() {
            if fill < SEGMENT_LENGTH {
                hash.add(input[pos]);
                fill += 1;
                if fill < SEGMENT_LENGTH {
                    continue;
                }
            } else {
                hash.roll(input[pos], input[pos - SEGMENT_LENGTH]);
            }

            let end = pos + 1;
            let start = end - SEGMENT_LENGTH;
            let h = hash.mix();

            if let Some((offset, ch)) = candidate {
                if offset + SEGMENT_LENGTH < start {
                    self.literals(output, &input[base..offset]);
                    let data = &input[offset..offset + SEGMENT_LENGTH];
                    self.declare(output, ch, data, frame.as_deref_mut())?;
                    base = offset + SEGMENT_LENGTH;
                    candidate = None;
                }
            }

            let mut found = self.find(h, &input[start..end])?;
            let hit = matches!(found, Lookup::Window(..) | Lookup::Cache(_));
            if let Some((offset, ch)) = candidate.filter(|_| hit) {
                // a candidate that ends where the hit begins is still declared
                if offset + SEGMENT_LENGTH <= start {
                    self.literals(output, &input[base..offset]);
                    let data = &input[offset..offset + SEGMENT_LENGTH];
                    self.declare(output, ch, data, frame.as_deref_mut())?;
                    base = offset + SEGMENT_LENGTH;
                    candidate = None;
                    // the declaration may have recycled the slot the hit named
                    found = self.find(h, &input[start..end])?;
                }
            }

            match found {
                Lookup::Window(index, segment) => {
                    candidate = None;
                    self.literals(output, &input[base..start]);
                    self.backreference(output, index, h, segment, frame.as_deref_mut());
                    base = end;
                    hash.reset();
                    fill = 0;
                }
                Lookup::Cache(segment) => {
                    candidate = None;
                    self.literals(output, &input[base..start]);
                    self.reference(output, h, segment, frame.as_deref_mut());
                    base = end;
                    hash.reset();
                    fill = 0;
                }
                Lookup::Collision => {
                    self.stats.collisions += 1;
                    trace!(hash = format_args!("{:#018x}", h), offset = start, "hash collision");
                }
                Lookup::Miss => {
                    if candidate.is_none() {
                        candidate = Some((start, h));
                    }
                }
            }
        }

        if let Some((offset, ch)) = candidate {
            self.literals(output, &input[base..offset]);
            let data = &input[offset..offset + SEGMENT_LENGTH];
            self.declare(output, ch, data, frame.as_deref_mut())?;
            base = offset + SEGMENT_LENGTH;
        }
        self.literals(output, &input[base..]);

        self.stats.output_bytes += (output.len() - before) as u64;
        Ok(())
    }

    /// Window first, then cache; a hit only counts if the bytes match.
    fn find(&self, hash: u64, data: &[u8]) -> XCodecResult<Lookup> {
        if let Some((index, segment)) = self.window.lookup(hash) {
            return Ok(if segment.matches(data) {
                Lookup::Window(index, segment.clone())
            } else {
                Lookup::Collision
            });
        }
        Ok(match self.cache.lookup(hash)? {
            Some(segment) if segment.matches(data) => Lookup::Cache(segment),
            Some(_) => Lookup::Collision,
            None => Lookup::Miss,
        })
    }

    fn literals(&mut self, output: &mut BytesMut, data: &[u8]) {
        self.stats.literal_bytes += data.len() as u64;
        escape_into(output, data);
    }

    fn declare(
        &mut self,
        output: &mut BytesMut,
        hash: u64,
        data: &[u8],
        frame: Option<&mut ReferenceFrame>,
    ) -> XCodecResult<()> {
        let segment = Segment::from_slice(data)?;
        self.cache.enter(hash, segment.clone())?;
        output.put_u8(ESCAPE_CHAR);
        if self.out_of_band {
            output.put_u8(OP_REF);
            output.put_u64(hash);
        } else {
            output.put_u8(OP_EXTRACT);
            output.put_u64(hash);
            output.put_slice(data);
        }
        trace!(hash = format_args!("{:#018x}", hash), out_of_band = self.out_of_band, "declared segment");
        self.stats.declarations += 1;
        self.window.declare(hash, segment.clone());
        if let Some(frame) = frame {
            frame.record(hash, segment);
        }
        Ok(())
    }

    fn reference(
        &mut self,
        output: &mut BytesMut,
        hash: u64,
        segment: Segment,
        frame: Option<&mut ReferenceFrame>,
    ) {
        output.put_u8(ESCAPE_CHAR);
        output.put_u8(OP_REF);
        output.put_u64(hash);
        self.stats.references += 1;
        self.window.declare(hash, segment.clone());
        if let Some(frame) = frame {
            frame.record(hash, segment);
        }
    }

    fn backreference(
        &mut self,
        output: &mut BytesMut,
        index: u8,
        hash: u64,
        segment: Segment,
        frame: Option<&mut ReferenceFrame>,
    ) {
        output.put_u8(ESCAPE_CHAR);
        output.put_u8(OP_BACKREF);
        output.put_u8(index);
        self.stats.backreferences += 1;
        if let Some(frame) = frame {
            frame.record(hash, segment);
        }
    }
}
