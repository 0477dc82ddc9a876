/*!
Plain alignment records as handed over by an alignment-file reader, along with the scores used to rank them.
Positions are 0-based and point at the first aligned (non-clipped) query base, matching the SAM `POS` convention.

# Example usage
```rust
use pilecon::alignment::{parse_cigar, AlignmentRecord};

let cigar = parse_cigar("2S6M1I3M").unwrap();
let record = AlignmentRecord::new(7, "read_7".to_string(), 100, cigar, b"TTACGTACGGTA".to_vec(), None, Some(20));
assert_eq!(record.length(), 10);
assert_eq!(record.full_length(), 12);
assert_eq!(record.reference_span(), 9);
assert_eq!(record.normalized_score(), Some(2.0));
```
*/

use simple_error::bail;

/// The full set of SAM edit operations.
/// Only a subset is understood by the decoder, the others are reported as malformed input there.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CigarOp {
    /// M - consumes query and reference
    Match,
    /// I - consumes query only
    Insertion,
    /// D - consumes reference only
    Deletion,
    /// N - consumes reference only
    RefSkip,
    /// S - consumes query only, bases are present in the sequence
    SoftClip,
    /// H - consumes nothing, bases are absent from the sequence
    HardClip,
    /// P - consumes nothing
    Padding,
    /// = - consumes query and reference
    SequenceMatch,
    /// X - consumes query and reference
    SequenceMismatch
}

impl CigarOp {
    /// Maps a SAM CIGAR character to the operation
    pub fn from_char(c: char) -> Option<CigarOp> {
        match c {
            'M' => Some(CigarOp::Match),
            'I' => Some(CigarOp::Insertion),
            'D' => Some(CigarOp::Deletion),
            'N' => Some(CigarOp::RefSkip),
            'S' => Some(CigarOp::SoftClip),
            'H' => Some(CigarOp::HardClip),
            'P' => Some(CigarOp::Padding),
            '=' => Some(CigarOp::SequenceMatch),
            'X' => Some(CigarOp::SequenceMismatch),
            _ => None
        }
    }

    pub fn to_char(&self) -> char {
        match self {
            CigarOp::Match => 'M',
            CigarOp::Insertion => 'I',
            CigarOp::Deletion => 'D',
            CigarOp::RefSkip => 'N',
            CigarOp::SoftClip => 'S',
            CigarOp::HardClip => 'H',
            CigarOp::Padding => 'P',
            CigarOp::SequenceMatch => '=',
            CigarOp::SequenceMismatch => 'X'
        }
    }

    /// True if the operation consumes query bases present in the sequence
    pub fn consumes_query(&self) -> bool {
        matches!(self, CigarOp::Match | CigarOp::Insertion | CigarOp::SoftClip | CigarOp::SequenceMatch | CigarOp::SequenceMismatch)
    }

    /// True if the operation consumes reference bases
    pub fn consumes_reference(&self) -> bool {
        matches!(self, CigarOp::Match | CigarOp::Deletion | CigarOp::RefSkip | CigarOp::SequenceMatch | CigarOp::SequenceMismatch)
    }
}

/// A single run of one edit operation
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CigarUnit {
    pub op: CigarOp,
    pub len: usize
}

impl CigarUnit {
    pub fn new(op: CigarOp, len: usize) -> CigarUnit {
        CigarUnit { op, len }
    }
}

/// Parses a SAM CIGAR string into edit operations. A lone `*` is an empty CIGAR.
/// # Arguments
/// * `cigar` - the CIGAR string, e.g. "5S100M2D20M"
/// # Errors
/// * if an operation has no length or the operation character is unknown
/// # Examples
/// ```rust
/// use pilecon::alignment::{parse_cigar, CigarOp, CigarUnit};
/// let ops = parse_cigar("3M1D2M").unwrap();
/// assert_eq!(ops, vec![
///     CigarUnit::new(CigarOp::Match, 3),
///     CigarUnit::new(CigarOp::Deletion, 1),
///     CigarUnit::new(CigarOp::Match, 2)
/// ]);
/// assert!(parse_cigar("3Q").is_err());
/// ```
pub fn parse_cigar(cigar: &str) -> Result<Vec<CigarUnit>, Box<dyn std::error::Error>> {
    if cigar == "*" {
        return Ok(vec![]);
    }

    let mut ops = vec![];
    let mut num_start = 0;
    for (i, c) in cigar.char_indices() {
        if c.is_ascii_digit() {
            continue;
        }
        let len: usize = match cigar[num_start..i].parse() {
            Ok(l) => l,
            Err(_) => bail!("Invalid CIGAR length before '{}' in \"{}\"", c, cigar)
        };
        let op = match CigarOp::from_char(c) {
            Some(op) => op,
            None => bail!("Unknown CIGAR operation '{}' in \"{}\"", c, cigar)
        };
        ops.push(CigarUnit::new(op, len));
        num_start = i + 1;
    }

    if num_start != cigar.len() {
        bail!("CIGAR \"{}\" ends with a dangling length", cigar);
    }
    Ok(ops)
}

/// Renders edit operations back into a SAM CIGAR string
pub fn cigar_to_string(cigar: &[CigarUnit]) -> String {
    if cigar.is_empty() {
        return "*".to_string();
    }
    cigar.iter()
        .map(|u| format!("{}{}", u.len, u.op.to_char()))
        .collect()
}

/// A single alignment of a read against the reference.
/// The edit operations are fixed at construction, so the derived lengths are computed once and stored.
/// The raw score is the only mutable part and only changes through `penalize`.
#[derive(Clone, Debug, PartialEq)]
pub struct AlignmentRecord {
    /// Caller-assigned identifier, unique within a reference context
    id: u64,
    /// The query name
    name: String,
    /// 0-based reference position of the first aligned base
    position: usize,
    /// The edit operations
    cigar: Vec<CigarUnit>,
    /// The query sequence, hard clipped bases excluded
    sequence: Vec<u8>,
    /// Raw phred qualities (no ASCII offset) parallel to `sequence`; None if the reader had none
    quality: Option<Vec<u8>>,
    /// The raw alignment score, typically the AS tag
    score: Option<i64>,
    /// Match + insertion bases
    length: usize,
    /// `length` plus all clipped bases
    full_length: usize
}

impl AlignmentRecord {
    /// Constructor
    /// # Arguments
    /// * `id` - unique identifier for this alignment
    /// * `name` - the query name
    /// * `position` - 0-based reference position of the first aligned base, i.e. after any leading clips (the SAM `POS` convention, not the unclipped start)
    /// * `cigar` - the edit operations
    /// * `sequence` - the query sequence
    /// * `quality` - optional raw phred qualities, parallel to `sequence`
    /// * `score` - optional raw alignment score
    pub fn new(id: u64, name: String, position: usize, cigar: Vec<CigarUnit>, sequence: Vec<u8>, quality: Option<Vec<u8>>, score: Option<i64>) -> AlignmentRecord {
        let length: usize = cigar.iter()
            .filter(|u| matches!(u.op, CigarOp::Match | CigarOp::Insertion | CigarOp::SequenceMatch | CigarOp::SequenceMismatch))
            .map(|u| u.len)
            .sum();
        let clipped: usize = cigar.iter()
            .filter(|u| matches!(u.op, CigarOp::SoftClip | CigarOp::HardClip))
            .map(|u| u.len)
            .sum();
        AlignmentRecord {
            id,
            name,
            position,
            cigar,
            sequence,
            quality,
            score,
            length,
            full_length: length + clipped
        }
    }

    /// Number of reference bases covered by this alignment
    pub fn reference_span(&self) -> usize {
        self.cigar.iter()
            .filter(|u| u.op.consumes_reference())
            .map(|u| u.len)
            .sum()
    }

    /// Exclusive end of the reference interval covered by this alignment
    pub fn reference_end(&self) -> usize {
        self.position + self.reference_span()
    }

    /// Raw score divided by the aligned length
    pub fn normalized_score(&self) -> Option<f64> {
        let score = self.score?;
        if self.length == 0 {
            return None;
        }
        Some(score as f64 / self.length as f64)
    }

    /// The ranking score, `(score / length) * (length / (k + length))`.
    /// This tends to `score / length` for long alignments and discounts short ones.
    /// # Arguments
    /// * `short_alignment_penalty` - the correction constant `k`
    pub fn length_corrected_score(&self, short_alignment_penalty: f64) -> Option<f64> {
        let normalized = self.normalized_score()?;
        let length = self.length as f64;
        Some(normalized * (length / (short_alignment_penalty + length)))
    }

    /// Subtracts a penalty from the raw score. Records without a score are left as is.
    pub fn penalize(&mut self, penalty: i64) {
        if let Some(s) = self.score.as_mut() {
            *s -= penalty;
        }
    }

    // getters
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn cigar(&self) -> &[CigarUnit] {
        &self.cigar
    }

    pub fn sequence(&self) -> &[u8] {
        &self.sequence
    }

    pub fn quality(&self) -> Option<&[u8]> {
        self.quality.as_deref()
    }

    pub fn score(&self) -> Option<i64> {
        self.score
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn full_length(&self) -> usize {
        self.full_length
    }
}
