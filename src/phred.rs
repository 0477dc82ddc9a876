
/// Converts an accumulated column frequency into a phred-like value: `round(sqrt(freq * scale))`, clamped to `max_phred`.
/// # Arguments
/// * `frequency` - the accumulated frequency, negative values are treated as 0
/// * `scale` - the scaling constant shared with `phred_to_freq`
/// * `max_phred` - the largest value that gets returned
/// # Examples
/// ```rust
/// use pilecon::phred::freq_to_phred;
/// assert_eq!(freq_to_phred(0.0, 120.0, 40), 0);
/// assert_eq!(freq_to_phred(10.0, 120.0, 40), 35);
/// assert_eq!(freq_to_phred(1000.0, 120.0, 40), 40);
/// ```
pub fn freq_to_phred(frequency: f64, scale: f64, max_phred: u8) -> u8 {
    let raw = (frequency.max(0.0) * scale).sqrt().round();
    raw.min(max_phred as f64) as u8
}

/// Converts a phred-like value back into a frequency: `round((phred^2 / scale) * 100) / 100`.
/// # Arguments
/// * `phred` - the phred value
/// * `scale` - the scaling constant shared with `freq_to_phred`
/// # Examples
/// ```rust
/// use pilecon::phred::phred_to_freq;
/// assert_eq!(phred_to_freq(0, 120.0), 0.0);
/// assert_eq!(phred_to_freq(30, 120.0), 7.5);
/// assert_eq!(phred_to_freq(40, 120.0), 13.33);
/// ```
pub fn phred_to_freq(phred: u8, scale: f64) -> f64 {
    let p = phred as f64;
    ((p * p / scale) * 100.0).round() / 100.0
}

/// Renders a frequency track as an ASCII phred string.
/// # Arguments
/// * `frequencies` - the values to encode
/// * `scale` - the scaling constant for `freq_to_phred`
/// * `max_phred` - the clamp for `freq_to_phred`
/// * `offset` - the ASCII offset, typically 33; encoded values saturate at 255
pub fn encode_frequencies(frequencies: &[f64], scale: f64, max_phred: u8, offset: u8) -> Vec<u8> {
    frequencies.iter()
        .map(|&f| freq_to_phred(f, scale, max_phred).saturating_add(offset))
        .collect()
}
