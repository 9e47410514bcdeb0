use crate::rng::FuzzRng;

/// Upper bound on the delta used by the arithmetic mutations.
const ARITH_MAX: u64 = 35;
/// Upper bound on the number of bytes `InsertRepeatedBytes` adds.
const MAX_REPEATED_BYTES: usize = 128;
/// Window size `ShuffleBytes` works on.
const MAX_SHUFFLE_WINDOW: usize = 8;
/// Draws before the mutator gives up looking for an applicable operator.
const MAX_OPERATOR_ATTEMPTS: usize = 64;

/// A `Mutator` derives a new candidate from an existing input.
///
/// Mutators are deterministic given the state of the [`FuzzRng`] they are
/// handed: the same RNG state and the same arguments always yield the same
/// output. Minimization relies on this to replay mutation chains.
pub trait Mutator: Send {
    /// Applies one randomly chosen transformation to `input`.
    ///
    /// # Arguments
    /// * `input`: The bytes to start from. May be empty.
    /// * `max_len`: Hard upper bound on the length of the output.
    /// * `crossover`: Optional second input whose bytes may be spliced in.
    /// * `rng`: The session's random source.
    ///
    /// # Panics
    /// Implementations may panic if `max_len == 0`; a zero length budget is a
    /// caller contract violation.
    fn mutate(
        &mut self,
        input: &[u8],
        max_len: usize,
        crossover: Option<&[u8]>,
        rng: &mut FuzzRng,
    ) -> Vec<u8>;
}

/// Whether an operator changed the buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationResult {
    Mutated,
    Skipped,
}

/// The byte-level operators [`ByteMutator`] draws from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationKind {
    ChangeBit,
    ChangeByte,
    EraseBytes,
    InsertByte,
    InsertRepeatedBytes,
    ShuffleBytes,
    ChangeAsciiInteger,
    ChangeBinaryInteger,
    CopyPart,
    Dictionary,
    CrossOver,
}

impl MutationKind {
    pub const ALL: [MutationKind; 11] = [
        MutationKind::ChangeBit,
        MutationKind::ChangeByte,
        MutationKind::EraseBytes,
        MutationKind::InsertByte,
        MutationKind::InsertRepeatedBytes,
        MutationKind::ShuffleBytes,
        MutationKind::ChangeAsciiInteger,
        MutationKind::ChangeBinaryInteger,
        MutationKind::CopyPart,
        MutationKind::Dictionary,
        MutationKind::CrossOver,
    ];
}

/// A general purpose byte mutator in the style of libFuzzer's default
/// mutation set, with dictionary support and crossover.
#[derive(Debug, Default, Clone)]
pub struct ByteMutator {
    dictionary: Vec<Vec<u8>>,
}

impl ByteMutator {
    /// Creates a mutator that draws dictionary tokens from `dictionary`.
    /// Empty tokens are ignored.
    pub fn new(dictionary: Vec<Vec<u8>>) -> Self {
        Self {
            dictionary: dictionary.into_iter().filter(|t| !t.is_empty()).collect(),
        }
    }

    pub fn dictionary(&self) -> &[Vec<u8>] {
        &self.dictionary
    }

    /// Applies a single operator to `data` in place.
    pub fn apply(
        &self,
        kind: MutationKind,
        data: &mut Vec<u8>,
        max_len: usize,
        crossover: Option<&[u8]>,
        rng: &mut FuzzRng,
    ) -> MutationResult {
        match kind {
            MutationKind::ChangeBit => change_bit(data, rng),
            MutationKind::ChangeByte => change_byte(data, rng),
            MutationKind::EraseBytes => erase_bytes(data, rng),
            MutationKind::InsertByte => insert_byte(data, max_len, rng),
            MutationKind::InsertRepeatedBytes => insert_repeated_bytes(data, max_len, rng),
            MutationKind::ShuffleBytes => shuffle_bytes(data, rng),
            MutationKind::ChangeAsciiInteger => change_ascii_integer(data, rng),
            MutationKind::ChangeBinaryInteger => change_binary_integer(data, rng),
            MutationKind::CopyPart => copy_part(data, max_len, rng),
            MutationKind::Dictionary => self.dictionary_token(data, max_len, rng),
            MutationKind::CrossOver => match crossover {
                Some(other) => cross_over(data, other, max_len, rng),
                None => MutationResult::Skipped,
            },
        }
    }

    fn dictionary_token(&self, data: &mut Vec<u8>, max_len: usize, rng: &mut FuzzRng) -> MutationResult {
        if self.dictionary.is_empty() {
            return MutationResult::Skipped;
        }
        let token = rng.choose(&self.dictionary);
        if !data.is_empty() && (data.len() + token.len() > max_len || rng.chance(0.5)) {
            // overwrite in place; a token longer than the data is clipped
            let len = token.len().min(data.len());
            let pos = rng.below(data.len() - len + 1);
            data[pos..pos + len].copy_from_slice(&token[..len]);
        } else {
            let pos = rng.below(data.len() + 1);
            data.splice(pos..pos, token.iter().copied());
        }
        MutationResult::Mutated
    }
}

impl Mutator for ByteMutator {
    fn mutate(
        &mut self,
        input: &[u8],
        max_len: usize,
        crossover: Option<&[u8]>,
        rng: &mut FuzzRng,
    ) -> Vec<u8> {
        assert!(max_len > 0, "ByteMutator::mutate called with max_len == 0");
        let mut data = input.to_vec();
        let mutated = (0..MAX_OPERATOR_ATTEMPTS).any(|_| {
            let kind = *rng.choose(&MutationKind::ALL);
            self.apply(kind, &mut data, max_len, crossover, rng) == MutationResult::Mutated
        });
        if !mutated {
            if data.is_empty() {
                data.push(rng.byte());
            } else {
                change_byte(&mut data, rng);
            }
        }
        data.truncate(max_len);
        data
    }
}

fn change_bit(data: &mut [u8], rng: &mut FuzzRng) -> MutationResult {
    if data.is_empty() {
        return MutationResult::Skipped;
    }
    let bit = rng.below(data.len() * 8);
    data[bit / 8] ^= 1 << (bit % 8);
    MutationResult::Mutated
}

fn change_byte(data: &mut [u8], rng: &mut FuzzRng) -> MutationResult {
    if data.is_empty() {
        return MutationResult::Skipped;
    }
    let pos = rng.below(data.len());
    // never a no-op
    data[pos] ^= rng.between(1, 255) as u8;
    MutationResult::Mutated
}

fn erase_bytes(data: &mut Vec<u8>, rng: &mut FuzzRng) -> MutationResult {
    if data.is_empty() {
        return MutationResult::Skipped;
    }
    let count = rng.between(1, (data.len() / 2).max(1));
    let pos = rng.below(data.len() - count + 1);
    data.drain(pos..pos + count);
    MutationResult::Mutated
}

fn insert_byte(data: &mut Vec<u8>, max_len: usize, rng: &mut FuzzRng) -> MutationResult {
    if data.len() >= max_len {
        return MutationResult::Skipped;
    }
    let pos = rng.below(data.len() + 1);
    data.insert(pos, rng.byte());
    MutationResult::Mutated
}

fn insert_repeated_bytes(data: &mut Vec<u8>, max_len: usize, rng: &mut FuzzRng) -> MutationResult {
    const MIN_REPEAT: usize = 3;
    if data.len() + MIN_REPEAT > max_len {
        return MutationResult::Skipped;
    }
    let count = rng.between(MIN_REPEAT, (max_len - data.len()).min(MAX_REPEATED_BYTES));
    let byte = if rng.chance(0.5) {
        rng.byte()
    } else if rng.chance(0.5) {
        0x00
    } else {
        0xff
    };
    let pos = rng.below(data.len() + 1);
    data.splice(pos..pos, std::iter::repeat_n(byte, count));
    MutationResult::Mutated
}

fn shuffle_bytes(data: &mut [u8], rng: &mut FuzzRng) -> MutationResult {
    if data.len() < 2 {
        return MutationResult::Skipped;
    }
    let window = rng.between(2, data.len().min(MAX_SHUFFLE_WINDOW));
    let pos = rng.below(data.len() - window + 1);
    rng.shuffle(&mut data[pos..pos + window]);
    MutationResult::Mutated
}

/// Finds a run of ASCII digits at or after a random position (wrapping to the
/// front) and replaces it with a nearby or random number.
fn change_ascii_integer(data: &mut Vec<u8>, rng: &mut FuzzRng) -> MutationResult {
    if data.is_empty() {
        return MutationResult::Skipped;
    }
    let from = rng.below(data.len());
    let found = data[from..]
        .iter()
        .position(u8::is_ascii_digit)
        .map(|p| p + from)
        .or_else(|| data[..from].iter().position(u8::is_ascii_digit));
    let Some(mut start) = found else {
        return MutationResult::Skipped;
    };
    while start > 0 && data[start - 1].is_ascii_digit() {
        start -= 1;
    }
    let end = data[start..]
        .iter()
        .position(|b| !b.is_ascii_digit())
        .map_or(data.len(), |p| p + start);

    let value: u64 = std::str::from_utf8(&data[start..end])
        .ok()
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(u64::MAX);
    let mut new_value = match rng.below(5) {
        0 => value.wrapping_add(1),
        1 => value.wrapping_sub(1),
        2 => value / 2,
        3 => value.wrapping_mul(2),
        _ => rng.below(usize::MAX) as u64 % value.saturating_mul(value).max(1),
    };
    if new_value == value {
        new_value = value.wrapping_add(1);
    }
    let replacement = new_value.to_string().into_bytes();
    data.splice(start..end, replacement);
    MutationResult::Mutated
}

/// Adds or subtracts a small delta to a 1, 2, 4 or 8 byte integer, in either byte order.
fn change_binary_integer(data: &mut [u8], rng: &mut FuzzRng) -> MutationResult {
    let widths: Vec<usize> = [1, 2, 4, 8].into_iter().filter(|w| *w <= data.len()).collect();
    if widths.is_empty() {
        return MutationResult::Skipped;
    }
    let width = *rng.choose(&widths);
    let pos = rng.below(data.len() - width + 1);
    let field = &mut data[pos..pos + width];
    let big_endian = rng.chance(0.5);

    let mut raw = [0u8; 8];
    if big_endian {
        raw[8 - width..].copy_from_slice(field);
    } else {
        raw[..width].copy_from_slice(field);
    }
    let value = if big_endian {
        u64::from_be_bytes(raw)
    } else {
        u64::from_le_bytes(raw)
    };
    let delta = rng.between(1, ARITH_MAX as usize) as u64;
    let value = if rng.chance(0.5) {
        value.wrapping_add(delta)
    } else {
        value.wrapping_sub(delta)
    };
    if big_endian {
        field.copy_from_slice(&value.to_be_bytes()[8 - width..]);
    } else {
        field.copy_from_slice(&value.to_le_bytes()[..width]);
    }
    MutationResult::Mutated
}

/// Duplicates a range of the input, either inserted elsewhere or written over
/// another range.
fn copy_part(data: &mut Vec<u8>, max_len: usize, rng: &mut FuzzRng) -> MutationResult {
    if data.is_empty() {
        return MutationResult::Skipped;
    }
    let from = rng.below(data.len());
    let len = rng.between(1, data.len() - from);
    let part = data[from..from + len].to_vec();

    if data.len() + len <= max_len && rng.chance(0.5) {
        let to = rng.below(data.len() + 1);
        data.splice(to..to, part);
    } else {
        if data.len() < 2 {
            return MutationResult::Skipped;
        }
        let to = rng.below(data.len());
        let len = len.min(data.len() - to);
        data[to..to + len].copy_from_slice(&part[..len]);
    }
    MutationResult::Mutated
}

/// Brings in bytes from a second input: inserts a part of it, overwrites with
/// a part of it, or joins a prefix of `data` with a suffix of `other`.
fn cross_over(data: &mut Vec<u8>, other: &[u8], max_len: usize, rng: &mut FuzzRng) -> MutationResult {
    if other.is_empty() {
        return MutationResult::Skipped;
    }
    let from = rng.below(other.len());
    let len = rng.between(1, other.len() - from);
    let part = &other[from..from + len];

    match rng.below(3) {
        0 if data.len() < max_len => {
            let to = rng.below(data.len() + 1);
            data.splice(to..to, part.iter().copied());
        }
        1 if !data.is_empty() => {
            let to = rng.below(data.len());
            let len = part.len().min(data.len() - to);
            data[to..to + len].copy_from_slice(&part[..len]);
        }
        _ => {
            let keep = rng.below(data.len() + 1);
            data.truncate(keep);
            data.extend_from_slice(&other[from..]);
        }
    }
    MutationResult::Mutated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_inputs() -> Vec<Vec<u8>> {
        vec![
            vec![],
            vec![0],
            b"ab".to_vec(),
            b"hello world 1234".to_vec(),
            vec![0xff; 300],
        ]
    }

    #[test]
    fn output_never_exceeds_max_len() {
        let mut mutator = ByteMutator::new(vec![b"TOKEN_LONGER_THAN_BUDGET".to_vec(), b"x".to_vec()]);
        let mut rng = FuzzRng::with_seed(0);
        let crossover = b"some crossover material of moderate length".to_vec();
        for input in all_inputs() {
            for max_len in [1, 2, 3, 8, 64, 1024] {
                for _ in 0..200 {
                    let out = mutator.mutate(&input, max_len, Some(&crossover), &mut rng);
                    assert!(out.len() <= max_len, "len {} > {max_len}", out.len());
                }
            }
        }
    }

    #[test]
    fn empty_input_produces_non_empty_output() {
        let mut mutator = ByteMutator::default();
        let mut rng = FuzzRng::with_seed(1);
        for _ in 0..500 {
            assert!(!mutator.mutate(&[], 16, None, &mut rng).is_empty());
        }
    }

    #[test]
    fn same_seed_same_outputs() {
        let run = |seed| {
            let mut mutator = ByteMutator::new(vec![b"bug".to_vec()]);
            let mut rng = FuzzRng::with_seed(seed);
            let mut input = b"seed input".to_vec();
            let mut outputs = Vec::new();
            for _ in 0..300 {
                input = mutator.mutate(&input, 64, Some(b"crossover"), &mut rng);
                outputs.push(input.clone());
            }
            outputs
        };
        assert_eq!(run(99), run(99));
        assert_ne!(run(99), run(100));
    }

    #[test]
    fn mutate_changes_input_most_of_the_time() {
        let mut mutator = ByteMutator::default();
        let mut rng = FuzzRng::with_seed(2);
        let input = b"abcdefgh".to_vec();
        let changed = (0..200)
            .filter(|_| mutator.mutate(&input, 64, None, &mut rng) != input)
            .count();
        assert!(changed > 150, "only {changed} of 200 mutations changed the input");
    }

    #[test]
    fn every_operator_applies_to_typical_input() {
        let mutator = ByteMutator::new(vec![b"tok".to_vec()]);
        let mut rng = FuzzRng::with_seed(3);
        for kind in MutationKind::ALL {
            let mut data = b"value=1234;".to_vec();
            let result = mutator.apply(kind, &mut data, 64, Some(b"other input"), &mut rng);
            assert_eq!(result, MutationResult::Mutated, "{kind:?} skipped");
        }
    }

    #[test]
    fn operators_skip_when_they_cannot_apply() {
        let mutator = ByteMutator::default();
        let mut rng = FuzzRng::with_seed(4);
        let mut empty = Vec::new();
        for kind in [
            MutationKind::ChangeBit,
            MutationKind::ChangeByte,
            MutationKind::EraseBytes,
            MutationKind::ShuffleBytes,
            MutationKind::ChangeAsciiInteger,
            MutationKind::ChangeBinaryInteger,
            MutationKind::CopyPart,
            MutationKind::Dictionary,
            MutationKind::CrossOver,
        ] {
            assert_eq!(mutator.apply(kind, &mut empty, 8, None, &mut rng), MutationResult::Skipped);
        }
        let mut full = vec![1u8; 8];
        assert_eq!(
            mutator.apply(MutationKind::InsertByte, &mut full, 8, None, &mut rng),
            MutationResult::Skipped
        );
        let mut no_digits = b"abc".to_vec();
        assert_eq!(
            mutator.apply(MutationKind::ChangeAsciiInteger, &mut no_digits, 8, None, &mut rng),
            MutationResult::Skipped
        );
    }

    #[test]
    fn erase_bytes_shrinks() {
        let mut rng = FuzzRng::with_seed(5);
        for _ in 0..100 {
            let mut data = b"xxxbugxxx".to_vec();
            erase_bytes(&mut data, &mut rng);
            assert!(data.len() < 9 && data.len() >= 4);
        }
        let mut single = vec![7];
        erase_bytes(&mut single, &mut rng);
        assert!(single.is_empty());
    }

    #[test]
    fn dictionary_tokens_end_up_in_output() {
        let mutator = ByteMutator::new(vec![b"bug".to_vec()]);
        let mut rng = FuzzRng::with_seed(6);
        for _ in 0..50 {
            let mut data = b"aaaaaaaaaa".to_vec();
            mutator.apply(MutationKind::Dictionary, &mut data, 64, None, &mut rng);
            assert!(data.windows(3).any(|w| w == b"bug"), "{data:?}");
        }
    }

    #[test]
    fn ascii_integer_is_rewritten() {
        let mut rng = FuzzRng::with_seed(7);
        let mut data = b"n=41".to_vec();
        change_ascii_integer(&mut data, &mut rng);
        assert!(data.starts_with(b"n="));
        assert_ne!(data, b"n=41");
        assert!(data[2..].iter().all(u8::is_ascii_digit));
    }

    #[test]
    fn crossover_only_uses_bytes_from_either_side() {
        let mut rng = FuzzRng::with_seed(8);
        for _ in 0..200 {
            let mut data = b"aaaa".to_vec();
            cross_over(&mut data, b"bbbb", 64, &mut rng);
            assert!(data.iter().all(|b| *b == b'a' || *b == b'b'));
            assert!(data.contains(&b'b'));
        }
    }

    #[test]
    #[should_panic(expected = "max_len == 0")]
    fn zero_budget_panics() {
        let mut mutator = ByteMutator::default();
        let mut rng = FuzzRng::with_seed(9);
        mutator.mutate(b"a", 0, None, &mut rng);
    }
}
