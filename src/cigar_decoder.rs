/*!
Converts a single alignment into an ordered list of per-reference-column observations.

Decoding happens in three steps:
1. Clips are stripped; soft clips shrink the query window, hard clipped bases are already absent from the sequence.
2. Unless disabled, both ends are trimmed back to the first match run that reaches past the taboo length, so that indels close to read termini are never observed.
3. The remaining operations are walked. Insertions never occupy a column of their own; they are merged into the observation before them, or, right after a deletion, they fill the deleted columns instead.

# Example usage
```rust
use pilecon::alignment::{parse_cigar, AlignmentRecord};
use pilecon::cigar_decoder::{CigarDecoder, DecodeOutcome, ObservedState};
use pilecon::polish_config::PolishConfigBuilder;

let config = PolishConfigBuilder::default().trim_ends(false).build().unwrap();
let decoder = CigarDecoder::from_config(&config);
let record = AlignmentRecord::new(0, "r".to_string(), 10, parse_cigar("2M1I2M").unwrap(), b"ACTGT".to_vec(), None, Some(5));
let observations = match decoder.decode(&record).unwrap() {
    DecodeOutcome::Observations(obs) => obs,
    DecodeOutcome::Skipped(reason) => panic!("unexpected skip: {reason:?}")
};
let columns: Vec<usize> = observations.iter().map(|o| o.column).collect();
assert_eq!(columns, vec![10, 11, 12, 13]);
assert_eq!(observations[1].state, ObservedState::Run(b"CT".to_vec()));
```
*/

use simple_error::bail;

use crate::alignment::{AlignmentRecord, CigarOp, CigarUnit};
use crate::polish_config::PolishConfig;

/// What a single alignment shows at one reference column
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum ObservedState {
    /// A single base, always one of A, C, G, T, N
    Base(u8),
    /// The column is deleted in this alignment
    Gap,
    /// Two or more bases, i.e. a base with inserted bases merged into it
    Run(Vec<u8>)
}

impl ObservedState {
    /// Appends inserted bases to this state
    fn extend(&mut self, bases: &[u8]) {
        match self {
            ObservedState::Base(b) => {
                let mut run = Vec::with_capacity(bases.len() + 1);
                run.push(*b);
                run.extend_from_slice(bases);
                *self = ObservedState::Run(run);
            },
            ObservedState::Gap => {
                *self = if bases.len() == 1 {
                    ObservedState::Base(bases[0])
                } else {
                    ObservedState::Run(bases.to_vec())
                };
            },
            ObservedState::Run(run) => run.extend_from_slice(bases)
        }
    }

    /// Number of symbols this state stands for; a gap has none
    pub fn len(&self) -> usize {
        match self {
            ObservedState::Base(_) => 1,
            ObservedState::Gap => 0,
            ObservedState::Run(run) => run.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A single per-column observation
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Observation {
    /// 0-based reference column
    pub column: usize,
    /// The observed state
    pub state: ObservedState,
    /// Raw phred quality of the observation
    pub quality: u8
}

/// Reasons a well-formed alignment is left out of a matrix
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SkipReason {
    /// Fewer aligned bases than the configured minimum remain after trimming
    TooShort,
    /// Less than the configured fraction of the aligned bases remain after trimming
    TooMuchTrimmed
}

/// The result of decoding a well-formed alignment
#[derive(Clone, Debug, PartialEq)]
pub enum DecodeOutcome {
    Observations(Vec<Observation>),
    Skipped(SkipReason)
}

/// Decoder settings, lifted from the polishing config
#[derive(Clone, Debug)]
pub struct CigarDecoder {
    /// If false, no end trimming happens at all
    trim_ends: bool,
    /// Fraction of the aligned length used as the taboo length
    taboo_fraction: f64,
    /// Explicit taboo length, overrides the fraction
    taboo_length: Option<usize>,
    /// Minimum aligned bases after each trim
    min_trimmed_length: usize,
    /// Minimum fraction of aligned bases after each trim
    min_trimmed_fraction: f64,
    /// Quality for records without qualities
    default_quality: u8
}

impl CigarDecoder {
    pub fn from_config(config: &PolishConfig) -> CigarDecoder {
        CigarDecoder {
            trim_ends: config.trim_ends,
            taboo_fraction: config.taboo_fraction,
            taboo_length: config.taboo_length,
            min_trimmed_length: config.min_trimmed_length,
            min_trimmed_fraction: config.min_trimmed_fraction,
            default_quality: config.default_quality
        }
    }

    /// Decodes one alignment into its observations.
    /// # Arguments
    /// * `record` - the alignment to decode
    /// # Errors
    /// * if the CIGAR has an operation other than M, I, D, S, H
    /// * if clips appear between aligned operations
    /// * if the sequence or quality lengths disagree with the CIGAR
    pub fn decode(&self, record: &AlignmentRecord) -> Result<DecodeOutcome, Box<dyn std::error::Error>> {
        let (mut ops, mut query_start, mut query_end) = strip_clips(record)?;
        let mut reference_start = record.position();

        if self.trim_ends {
            let original_length = aligned_length(&ops);
            let taboo = self.taboo_length
                .unwrap_or_else(|| (original_length as f64 * self.taboo_fraction).ceil() as usize);

            // head first
            match head_cut(&ops, taboo) {
                Some((cut_index, ref_consumed, query_consumed)) => {
                    ops.drain(..cut_index);
                    reference_start += ref_consumed;
                    query_start += query_consumed;
                },
                None => ops.clear()
            };
            if let Some(reason) = self.check_trimmed(aligned_length(&ops), original_length) {
                return Ok(DecodeOutcome::Skipped(reason));
            }

            // now the tail
            match tail_cut(&ops, taboo) {
                Some((keep, query_consumed)) => {
                    ops.truncate(keep);
                    query_end -= query_consumed;
                },
                None => ops.clear()
            };
            if let Some(reason) = self.check_trimmed(aligned_length(&ops), original_length) {
                return Ok(DecodeOutcome::Skipped(reason));
            }
        }

        let sequence = &record.sequence()[query_start..query_end];
        let quality: Vec<u8> = match record.quality() {
            Some(q) => q[query_start..query_end].to_vec(),
            None => vec![self.default_quality; sequence.len()]
        };

        Ok(DecodeOutcome::Observations(emit(&ops, reference_start, sequence, &quality)))
    }

    /// Returns a skip reason if a trimmed alignment is no longer usable
    fn check_trimmed(&self, remaining: usize, original: usize) -> Option<SkipReason> {
        if remaining < self.min_trimmed_length {
            Some(SkipReason::TooShort)
        } else if (remaining as f64) < original as f64 * self.min_trimmed_fraction {
            Some(SkipReason::TooMuchTrimmed)
        } else {
            None
        }
    }
}

/// Checks that an alignment is well formed enough to decode, independent of any trimming.
/// # Arguments
/// * `record` - the alignment to check
/// # Errors
/// * if the CIGAR uses an unsupported operation, clips inside the aligned region, or disagrees with the sequence or quality lengths
pub fn validate(record: &AlignmentRecord) -> Result<(), Box<dyn std::error::Error>> {
    strip_clips(record).map(|_| ())
}

/// Validates the CIGAR against the sequence and removes clips.
/// Returns the aligned operations and the half-open query window they cover.
fn strip_clips(record: &AlignmentRecord) -> Result<(Vec<CigarUnit>, usize, usize), Box<dyn std::error::Error>> {
    let mut ops: Vec<CigarUnit> = Vec::with_capacity(record.cigar().len());
    let mut query_start = 0;
    let mut query_consumed = 0;
    let mut tail_clipped = false;
    for unit in record.cigar().iter() {
        match unit.op {
            CigarOp::Match | CigarOp::Insertion | CigarOp::Deletion => {
                if tail_clipped {
                    bail!("Alignment {} has clipping inside the aligned region", record.id());
                }
                ops.push(*unit);
            },
            CigarOp::SoftClip | CigarOp::HardClip => {
                if ops.is_empty() {
                    if unit.op == CigarOp::SoftClip {
                        query_start += unit.len;
                    }
                } else {
                    tail_clipped = true;
                }
            },
            other => bail!("Alignment {} has unsupported CIGAR operation '{}'", record.id(), other.to_char())
        };
        if unit.op.consumes_query() {
            query_consumed += unit.len;
        }
    }

    let seq_len = record.sequence().len();
    if query_consumed != seq_len {
        bail!("Alignment {} has a CIGAR consuming {} query bases, but a sequence of length {}", record.id(), query_consumed, seq_len);
    }
    if let Some(q) = record.quality() {
        if q.len() != seq_len {
            bail!("Alignment {} has {} qualities for {} bases", record.id(), q.len(), seq_len);
        }
    }

    let query_end = query_start + aligned_length(&ops);
    Ok((ops, query_start, query_end))
}

/// Number of query bases consumed by match and insertion operations
fn aligned_length(ops: &[CigarUnit]) -> usize {
    ops.iter()
        .filter(|u| matches!(u.op, CigarOp::Match | CigarOp::Insertion))
        .map(|u| u.len)
        .sum()
}

/// Scans from the head for the first match run reaching past the taboo length.
/// Returns the index of that run with the reference and query bases consumed before it, or None if no run qualifies.
fn head_cut(ops: &[CigarUnit], taboo: usize) -> Option<(usize, usize, usize)> {
    let mut accumulated = 0;
    let mut ref_consumed = 0;
    let mut query_consumed = 0;
    for (i, unit) in ops.iter().enumerate() {
        match unit.op {
            CigarOp::Match => {
                if accumulated + unit.len > taboo {
                    return Some((i, ref_consumed, query_consumed));
                }
                accumulated += unit.len;
                ref_consumed += unit.len;
                query_consumed += unit.len;
            },
            CigarOp::Insertion => {
                accumulated += unit.len;
                query_consumed += unit.len;
            },
            CigarOp::Deletion => ref_consumed += unit.len,
            _ => unreachable!("clips are stripped before trimming")
        };
    }
    None
}

/// Mirror of `head_cut` from the tail.
/// Returns the number of operations to keep and the query bases consumed after them.
fn tail_cut(ops: &[CigarUnit], taboo: usize) -> Option<(usize, usize)> {
    let mut accumulated = 0;
    let mut query_consumed = 0;
    for (i, unit) in ops.iter().enumerate().rev() {
        match unit.op {
            CigarOp::Match => {
                if accumulated + unit.len > taboo {
                    return Some((i + 1, query_consumed));
                }
                accumulated += unit.len;
                query_consumed += unit.len;
            },
            CigarOp::Insertion => {
                accumulated += unit.len;
                query_consumed += unit.len;
            },
            CigarOp::Deletion => {},
            _ => unreachable!("clips are stripped before trimming")
        };
    }
    None
}

/// Upper-cases a base and maps anything outside ACGT to N
fn normalize_base(base: u8) -> u8 {
    match base.to_ascii_uppercase() {
        b @ (b'A' | b'C' | b'G' | b'T') => b,
        _ => b'N'
    }
}

/// Walks the aligned operations and creates the observations
/// # Arguments
/// * `ops` - aligned operations only (M, I, D)
/// * `reference_start` - the reference column of the first operation
/// * `sequence` - the query bases covered by `ops`
/// * `quality` - qualities parallel to `sequence`
fn emit(ops: &[CigarUnit], reference_start: usize, sequence: &[u8], quality: &[u8]) -> Vec<Observation> {
    let mut observations: Vec<Observation> = Vec::with_capacity(sequence.len());
    let mut column = reference_start;
    let mut query_index = 0;

    // index of the first gap of the deletion immediately before the current operation
    let mut deletion_start: Option<usize> = None;
    // an insertion that arrived before anything was emitted
    let mut pending_prefix: Option<(Vec<u8>, u8)> = None;

    for unit in ops.iter() {
        match unit.op {
            CigarOp::Match => {
                for _ in 0..unit.len {
                    let base = normalize_base(sequence[query_index]);
                    let mut state = ObservedState::Base(base);
                    let mut qual = quality[query_index];
                    if let Some((mut prefix, prefix_qual)) = pending_prefix.take() {
                        prefix.push(base);
                        state = ObservedState::Run(prefix);
                        qual = qual.min(prefix_qual);
                    }
                    observations.push(Observation { column, state, quality: qual });
                    column += 1;
                    query_index += 1;
                }
                deletion_start = None;
            },
            CigarOp::Deletion => {
                // gaps take the lesser of the flanking base qualities
                let before = query_index.checked_sub(1).map(|i| quality[i]);
                let after = quality.get(query_index).cloned();
                let qual = match (before, after) {
                    (Some(b), Some(a)) => b.min(a),
                    (Some(q), None) | (None, Some(q)) => q,
                    (None, None) => 0
                };
                if deletion_start.is_none() && unit.len > 0 {
                    deletion_start = Some(observations.len());
                }
                for _ in 0..unit.len {
                    observations.push(Observation { column, state: ObservedState::Gap, quality: qual });
                    column += 1;
                }
            },
            CigarOp::Insertion => {
                let end = query_index + unit.len;
                let bases: Vec<u8> = sequence[query_index..end].iter().map(|&b| normalize_base(b)).collect();
                let quals = &quality[query_index..end];
                query_index = end;

                if let Some(start) = deletion_start.take() {
                    // deletion + insertion is really a mismatch, so fill the gaps with the inserted bases
                    let num_gaps = observations.len() - start;
                    for (offset, obs) in observations[start..].iter_mut().enumerate().take(bases.len()) {
                        obs.state = ObservedState::Base(bases[offset]);
                        obs.quality = quals[offset];
                    }
                    if bases.len() > num_gaps {
                        let last = observations.last_mut().unwrap();
                        last.state.extend(&bases[num_gaps..]);
                        last.quality = quals[num_gaps - 1..].iter().cloned().min().unwrap_or(last.quality);
                    }
                } else if let Some(last) = observations.last_mut() {
                    last.state.extend(&bases);
                    last.quality = quals.iter().cloned().fold(last.quality, u8::min);
                } else {
                    let min_qual = quals.iter().cloned().min().unwrap_or(0);
                    pending_prefix = match pending_prefix.take() {
                        Some((mut prefix, prefix_qual)) => {
                            prefix.extend_from_slice(&bases);
                            Some((prefix, prefix_qual.min(min_qual)))
                        },
                        None => Some((bases, min_qual))
                    };
                }
            },
            _ => unreachable!("clips are stripped before emitting")
        };
    }

    observations
}
