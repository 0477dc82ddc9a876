
use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::alignment::{AlignmentRecord, CigarOp, CigarUnit};

const BASES: [u8; 4] = [b'A', b'C', b'G', b'T'];

/// Match reward used when scoring simulated alignments
const MATCH_SCORE: i64 = 2;
/// Penalty for a mismatch or a single indel base
const ERROR_PENALTY: i64 = 4;

/// Creates a random DNA reference
/// # Arguments
/// * `seq_len` - the length of the reference
/// * `seed` - the RNG seed, the same seed always gives the same reference
pub fn generate_reference(seq_len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let base_distribution = Uniform::new(0, BASES.len());
    (0..seq_len)
        .map(|_i| BASES[rng.sample(base_distribution)])
        .collect()
}

/// Replaces every base with the next one in ACGT order, wrapping T to A.
/// Anything outside ACGT is left as is.
pub fn rotate_bases(sequence: &[u8]) -> Vec<u8> {
    sequence.iter()
        .map(|&c| match BASES.iter().position(|&b| b == c) {
            Some(i) => BASES[(i + 1) % BASES.len()],
            None => c
        })
        .collect()
}

/// Creates a second haplotype with a SNP at regular intervals.
/// Returns the haplotype and the SNP columns.
/// # Arguments
/// * `reference` - the starting haplotype
/// * `spacing` - distance between SNPs
/// * `offset` - column of the first SNP
pub fn inject_snps(reference: &[u8], spacing: usize, offset: usize) -> (Vec<u8>, Vec<usize>) {
    assert!(spacing > 0);
    let mut haplotype = reference.to_vec();
    let columns: Vec<usize> = (offset..reference.len()).step_by(spacing).collect();
    for &c in columns.iter() {
        haplotype[c] = rotate_bases(&reference[c..(c + 1)])[0];
    }
    (haplotype, columns)
}

/// Creates error-free, gapless reads tiled across a haplotype, scored against the reference.
/// Reads start every `step` bases and never hang off the end.
/// # Arguments
/// * `haplotype` - the source of the read bases
/// * `reference` - the sequence the reads are scored against, same length as `haplotype`
/// * `read_len` - the length of each read
/// * `step` - distance between read starts
/// * `first_id` - the id of the first read, the others count up from here
pub fn tile_alignments(haplotype: &[u8], reference: &[u8], read_len: usize, step: usize, first_id: u64) -> Vec<AlignmentRecord> {
    assert_eq!(haplotype.len(), reference.len());
    assert!(step > 0 && read_len > 0);
    if read_len > haplotype.len() {
        return vec![];
    }

    (0..=(haplotype.len() - read_len)).step_by(step)
        .enumerate()
        .map(|(i, position)| {
            let id = first_id + i as u64;
            let sequence = haplotype[position..(position + read_len)].to_vec();
            let score: i64 = sequence.iter()
                .zip(reference[position..(position + read_len)].iter())
                .map(|(a, b)| if a == b { MATCH_SCORE } else { -ERROR_PENALTY })
                .sum();
            AlignmentRecord::new(
                id, format!("tile_{id}"), position,
                vec![CigarUnit::new(CigarOp::Match, read_len)],
                sequence, None, Some(score)
            )
        })
        .collect()
}

/// Creates a set of reads sampled from a reference with random errors, along with their CIGARs and scores.
/// The first and last reference base of each read are always error-free, so every CIGAR starts and ends with a match.
/// # Arguments
/// * `reference` - the sequence to sample from
/// * `num_reads` - the number of reads to generate
/// * `read_len` - the number of reference bases each read spans
/// * `error_rate` - overall error rate, assumes mismatch, insertion, and deletion are equally likely sub-components of this error rate
/// * `seed` - the RNG seed
pub fn simulate_alignments(reference: &[u8], num_reads: usize, read_len: usize, error_rate: f64, seed: u64) -> Vec<AlignmentRecord> {
    assert!(read_len > 0 && read_len <= reference.len());
    assert!((0.0..=1.0).contains(&error_rate));

    let mut rng = StdRng::seed_from_u64(seed);
    let start_distribution = Uniform::new_inclusive(0, reference.len() - read_len);
    let base_distribution = Uniform::new(0, BASES.len());
    let basem1_distribution = Uniform::new(1, BASES.len());
    let error_distribution = Uniform::new(0.0, 1.0);
    let error_type_distribution = Uniform::new(0, 3);

    (0..num_reads)
        .map(|read_index| {
            let position = rng.sample(start_distribution);
            let mut sequence = vec![];
            let mut cigar: Vec<CigarUnit> = vec![];
            let mut score = 0;

            let mut offset = 0;
            while offset < read_len {
                let c = reference[position + offset];
                let interior = offset > 0 && offset + 1 < read_len;
                let is_error = interior && rng.sample(error_distribution) < error_rate;
                let op = if is_error {
                    score -= ERROR_PENALTY;
                    match rng.sample(error_type_distribution) {
                        0 => {
                            // substitution
                            let base_index = BASES.iter().position(|&b| b == c).unwrap_or(0);
                            let sub_offset = rng.sample(basem1_distribution);
                            sequence.push(BASES[(base_index + sub_offset) % BASES.len()]);
                            offset += 1;
                            CigarOp::Match
                        },
                        1 => {
                            // deletion
                            offset += 1;
                            CigarOp::Deletion
                        },
                        2 => {
                            // insertion
                            sequence.push(BASES[rng.sample(base_distribution)]);
                            CigarOp::Insertion
                        },
                        _ => panic!("no impl")
                    }
                } else {
                    sequence.push(c);
                    offset += 1;
                    score += MATCH_SCORE;
                    CigarOp::Match
                };
                push_op(&mut cigar, op);
            }

            AlignmentRecord::new(
                read_index as u64, format!("sim_{read_index}"), position,
                cigar, sequence, None, Some(score)
            )
        })
        .collect()
}

/// Extends the last CIGAR unit if it has the same operation, otherwise starts a new one
fn push_op(cigar: &mut Vec<CigarUnit>, op: CigarOp) {
    match cigar.last_mut() {
        Some(unit) if unit.op == op => unit.len += 1,
        _ => cigar.push(CigarUnit::new(op, 1))
    };
}
