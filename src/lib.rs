/*!
# pilecon
This library provides a pileup-based consensus and variant engine for a single reference sequence.
Alignments against the reference are retained in score-ranked bins, decoded into per-column observations, and reduced to a consensus with per-base confidence and to ranked variant calls.

Key features:
* Bounded retention: each genomic bin keeps only its best alignments, ranked by a length-corrected score
* End trimming that avoids the spurious indels aligners tend to leave near read ends
* Merged insertion states and deletion/insertion correction during decoding
* A single-pass haplotype separation that isolates the haplotype matching the reference
* A coverage-dip and entropy heuristic that flags likely chimeric joins

Performance notes:
* Every matrix is rebuilt from scratch for each call, so cost scales with the retained bases rather than with the number of offered alignments
* Chimera scans only build matrices over small windows around each dip

# Example usage
```rust
use pilecon::alignment::{parse_cigar, AlignmentRecord};
use pilecon::polish_config::PolishConfigBuilder;
use pilecon::reference_context::ReferenceContext;

let reference = b"ACGTACGTACGT".to_vec();
let reads = [
    (0, "12M", b"ACGTACGTACGT".to_vec()),
    (0, "4M1I8M", b"ACGTTACGTACGT".to_vec()),
    (0, "4M1I8M", b"ACGTTACGTACGT".to_vec()),
    (0, "4M1I8M", b"ACGTTACGTACGT".to_vec()),
    (0, "4M1D7M", b"ACGTCGTACGT".to_vec()),
];

let config = PolishConfigBuilder::default()
    .trim_ends(false)
    .build()
    .unwrap();
let mut context = ReferenceContext::new("example".to_string(), reference.len(), config).unwrap();
context.set_reference(reference, None).unwrap();
for (i, (position, cigar, sequence)) in reads.into_iter().enumerate() {
    let record = AlignmentRecord::new(i as u64, format!("read_{i}"), position, parse_cigar(cigar).unwrap(), sequence, None, Some(20));
    context.admit(record);
}

// the insertion after column 3 is supported by 3 of 5 reads, the deletion at column 4 by only 1
let consensus = context.call_consensus();
assert_eq!(consensus.sequence(), b"ACGTTACGTACGT");
assert_eq!(consensus.confidence()[3..6], [3.0, 3.0, 4.0]);
```
*/

/// Alignment records and CIGAR operations
pub mod alignment;
/// Score-ranked, binned retention of alignments
pub mod alignment_store;
/// Coverage-dip and entropy based chimera detection
pub mod chimera;
/// Turns one alignment into per-column observations
pub mod cigar_decoder;
/// Majority-vote consensus calling
pub mod consensus;
/// Utility for generating examples
pub mod example_gen;
/// Single-pass haplotype separation
pub mod haplotype;
/// Frequency and phred transforms
pub mod phred;
/// Configuration for a ReferenceContext
pub mod polish_config;
/// Owns everything known about a single reference
pub mod reference_context;
/// Per-column accumulation of observed states
pub mod state_matrix;
/// Ranked variant calls per column
pub mod variants;
