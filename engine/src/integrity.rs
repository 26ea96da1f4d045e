//! Partial-content integrity verification.
//!
//! Before a source file is deleted the engine must be confident that the
//! staged copy holds the same bytes, without reading multi-hundred-GB files
//! in full. A fingerprint hashes the file size followed by a bounded sample
//! of blocks:
//! - files at or below the sample budget (`block_count * block_size`) are
//!   hashed whole
//! - larger files hash `block_count` blocks whose offsets are drawn from a
//!   stream seeded by (relative path, size), aligned down to 4 KiB
//!
//! Source and destination share the relative path and (when equal) the
//! size, so both sides always sample the same offsets, run after run.

use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::EngineError;

/// Sampled block offsets are multiples of this.
pub const SAMPLE_ALIGNMENT: u64 = 4096;

pub const DEFAULT_BLOCK_COUNT: usize = 16;
pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024;

/// Upper bound on offset draws, per wanted block.
const DRAWS_PER_BLOCK: usize = 16;

const SEED_DOMAIN: &[u8] = b"tapestage.sample-offsets.v1";

/// Supported fingerprint hash functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintAlgorithm {
    /// SHA-256 (cryptographic, 256-bit)
    Sha256,
    /// BLAKE3 (modern, fast, 256-bit)
    Blake3,
}

impl fmt::Display for FingerprintAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => write!(f, "sha256"),
            Self::Blake3 => write!(f, "blake3"),
        }
    }
}

impl FingerprintAlgorithm {
    /// Parse algorithm from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "sha256" => Some(Self::Sha256),
            "blake3" => Some(Self::Blake3),
            _ => None,
        }
    }
}

/// How much of a file a fingerprint reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleParams {
    pub block_count: usize,
    pub block_size: u64,
    pub algorithm: FingerprintAlgorithm,
}

impl Default for SampleParams {
    fn default() -> Self {
        SampleParams {
            block_count: DEFAULT_BLOCK_COUNT,
            block_size: DEFAULT_BLOCK_SIZE,
            algorithm: FingerprintAlgorithm::Sha256,
        }
    }
}

impl SampleParams {
    /// Files at or below this many bytes are hashed whole.
    pub fn budget(&self) -> u64 {
        (self.block_count as u64).saturating_mul(self.block_size)
    }
}

/// A computed partial-content fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub algorithm: FingerprintAlgorithm,
    pub hex: String,
    /// False when the whole file was hashed
    pub sampled: bool,
    /// Content bytes fed to the hash (excluding the size prefix)
    pub bytes_hashed: u64,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

/// Outcome of comparing a source file with its candidate destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityVerdict {
    Match,
    SizeMismatch { source: u64, destination: u64 },
    ContentMismatch,
}

impl IntegrityVerdict {
    pub fn is_match(&self) -> bool {
        matches!(self, IntegrityVerdict::Match)
    }
}

impl fmt::Display for IntegrityVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Match => write!(f, "size and sampled content match"),
            Self::SizeMismatch {
                source,
                destination,
            } => write!(
                f,
                "size differs (source {} bytes, destination {} bytes)",
                source, destination
            ),
            Self::ContentMismatch => write!(f, "sampled content differs"),
        }
    }
}

/// Trait for streaming hash functions
trait ChecksumHasher {
    fn update(&mut self, data: &[u8]);

    fn finalize(self: Box<Self>) -> String;
}

/// SHA-256 hasher (backed by sha2 crate)
struct Sha256Hasher {
    hasher: sha2::Sha256,
}

impl ChecksumHasher for Sha256Hasher {
    fn update(&mut self, data: &[u8]) {
        use sha2::Digest;
        self.hasher.update(data);
    }

    fn finalize(self: Box<Self>) -> String {
        use sha2::Digest;
        format!("{:x}", self.hasher.finalize())
    }
}

/// BLAKE3 hasher (backed by blake3 crate)
struct Blake3Hasher {
    hasher: blake3::Hasher,
}

impl ChecksumHasher for Blake3Hasher {
    fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    fn finalize(self: Box<Self>) -> String {
        self.hasher.finalize().to_hex().to_string()
    }
}

fn create_hasher(algorithm: FingerprintAlgorithm) -> Box<dyn ChecksumHasher> {
    match algorithm {
        FingerprintAlgorithm::Sha256 => Box::new(Sha256Hasher {
            hasher: sha2::Sha256::default(),
        }),
        FingerprintAlgorithm::Blake3 => Box::new(Blake3Hasher {
            hasher: blake3::Hasher::new(),
        }),
    }
}

fn align_down(offset: u64) -> u64 {
    offset - offset % SAMPLE_ALIGNMENT
}

fn evenly_spaced(max_start: u64, wanted: usize) -> BTreeSet<u64> {
    if wanted <= 1 {
        return BTreeSet::from([0]);
    }
    (0..wanted)
        .map(|i| {
            let offset = max_start as u128 * i as u128 / (wanted - 1) as u128;
            align_down(offset as u64)
        })
        .collect()
}

/// Block start offsets sampled for a file, in ascending order.
///
/// Returns `None` when the file fits in the sample budget and is hashed
/// whole. Otherwise offsets are pseudorandom but a pure function of
/// `(rel_path, size, params)`.
pub fn sample_offsets(rel_path: &str, size: u64, params: &SampleParams) -> Option<Vec<u64>> {
    if size <= params.budget() {
        return None;
    }

    let wanted = params.block_count.max(1);
    let max_start = size.saturating_sub(params.block_size.min(size));

    let mut seed = blake3::Hasher::new();
    seed.update(SEED_DOMAIN);
    seed.update(rel_path.as_bytes());
    seed.update(&[0]);
    seed.update(&size.to_le_bytes());
    let mut stream = seed.finalize_xof();

    let mut offsets = BTreeSet::new();
    let mut draw = [0u8; 8];
    for _ in 0..wanted * DRAWS_PER_BLOCK {
        if offsets.len() == wanted {
            break;
        }
        stream.fill(&mut draw);
        let raw = u64::from_le_bytes(draw) % max_start.saturating_add(1);
        offsets.insert(align_down(raw));
    }

    if offsets.len() < wanted {
        offsets = evenly_spaced(max_start, wanted);
    }

    Some(offsets.into_iter().collect())
}

/// Compute the partial-content fingerprint of one file.
///
/// `rel_path` seeds the offset choice and must be the same for both sides
/// of a comparison.
pub fn fingerprint_file(
    path: &Path,
    rel_path: &str,
    params: &SampleParams,
) -> Result<Fingerprint, EngineError> {
    let read_err = |e| EngineError::ReadError {
        path: path.to_path_buf(),
        source: e,
    };

    let mut file = File::open(path).map_err(read_err)?;
    let size = file.metadata().map_err(read_err)?.len();

    let mut hasher = create_hasher(params.algorithm);
    hasher.update(&size.to_le_bytes());

    let mut bytes_hashed = 0u64;
    let sampled = match sample_offsets(rel_path, size, params) {
        None => {
            let mut buffer = vec![0u8; 64 * 1024];
            loop {
                match file.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        hasher.update(&buffer[..n]);
                        bytes_hashed += n as u64;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(read_err(e)),
                }
            }
            false
        }
        Some(offsets) => {
            let mut block = vec![0u8; params.block_size.min(size) as usize];
            for offset in offsets {
                file.seek(SeekFrom::Start(offset)).map_err(read_err)?;
                file.read_exact(&mut block).map_err(read_err)?;
                hasher.update(&block);
                bytes_hashed += block.len() as u64;
            }
            true
        }
    };

    Ok(Fingerprint {
        algorithm: params.algorithm,
        hex: hasher.finalize(),
        sampled,
        bytes_hashed,
    })
}

/// Decide whether `destination` holds the same content as `source`.
///
/// Sizes are compared first; fingerprints are only computed when they agree.
pub fn compare_files(
    source: &Path,
    destination: &Path,
    rel_path: &str,
    params: &SampleParams,
) -> Result<IntegrityVerdict, EngineError> {
    let size_of = |path: &Path| {
        std::fs::metadata(path)
            .map(|m| m.len())
            .map_err(|e| EngineError::ReadError {
                path: path.to_path_buf(),
                source: e,
            })
    };

    let source_size = size_of(source)?;
    let destination_size = size_of(destination)?;
    if source_size != destination_size {
        return Ok(IntegrityVerdict::SizeMismatch {
            source: source_size,
            destination: destination_size,
        });
    }

    let source_fp = fingerprint_file(source, rel_path, params)?;
    let destination_fp = fingerprint_file(destination, rel_path, params)?;
    tracing::debug!(
        rel = rel_path,
        source = %source_fp,
        destination = %destination_fp,
        sampled = source_fp.sampled,
        "compared fingerprints"
    );

    if source_fp == destination_fp {
        Ok(IntegrityVerdict::Match)
    } else {
        Ok(IntegrityVerdict::ContentMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs;

    fn small_params() -> SampleParams {
        SampleParams {
            block_count: 4,
            block_size: 4096,
            algorithm: FingerprintAlgorithm::Sha256,
        }
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!(FingerprintAlgorithm::from_str("SHA256"), Some(FingerprintAlgorithm::Sha256));
        assert_eq!(FingerprintAlgorithm::from_str("blake3"), Some(FingerprintAlgorithm::Blake3));
        assert_eq!(FingerprintAlgorithm::from_str("md5"), None);
    }

    #[test]
    fn test_sha256_hasher() {
        let mut hasher = create_hasher(FingerprintAlgorithm::Sha256);
        hasher.update(b"hello");
        assert_eq!(
            hasher.finalize(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_small_file_is_hashed_whole_with_size_prefix() {
        use sha2::Digest;

        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("small.dat");
        fs::write(&path, b"hello").expect("Failed to write file");

        let fp = fingerprint_file(&path, "small.dat", &SampleParams::default())
            .expect("Fingerprint should succeed");

        let mut expected = sha2::Sha256::default();
        expected.update(5u64.to_le_bytes());
        expected.update(b"hello");
        assert_eq!(fp.hex, format!("{:x}", expected.finalize()));
        assert!(!fp.sampled);
        assert_eq!(fp.bytes_hashed, 5);
    }

    #[test]
    fn test_budget_boundary_is_hashed_whole() {
        let params = small_params();
        assert!(sample_offsets("a.bin", params.budget(), &params).is_none());
        assert!(sample_offsets("a.bin", params.budget() + 1, &params).is_some());
    }

    #[test]
    fn test_offsets_are_deterministic_aligned_and_in_bounds() {
        let params = SampleParams::default();
        let size = 10 * 1024 * 1024 * 1024u64;
        let first = sample_offsets("run1/a.bin", size, &params).unwrap();
        let second = sample_offsets("run1/a.bin", size, &params).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), params.block_count);
        for offset in &first {
            assert_eq!(offset % SAMPLE_ALIGNMENT, 0);
            assert!(offset + params.block_size <= size);
        }
        assert!(first.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_offsets_depend_on_path_and_size() {
        let params = SampleParams::default();
        let size = 4 * 1024 * 1024 * 1024u64;
        let a = sample_offsets("run1/a.bin", size, &params).unwrap();
        let b = sample_offsets("run1/b.bin", size, &params).unwrap();
        let c = sample_offsets("run1/a.bin", size + 4096, &params).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_falls_back_to_evenly_spaced_offsets() {
        // Only five aligned starts exist, far fewer than sixteen blocks
        let params = SampleParams {
            block_count: 16,
            block_size: 1024,
            algorithm: FingerprintAlgorithm::Sha256,
        };
        let offsets = sample_offsets("x.bin", 17 * 1024 + 1, &params).unwrap();
        assert_eq!(offsets, vec![0, 4096, 8192, 12288, 16384]);
    }

    #[test]
    fn test_identical_large_files_match() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src.bin");
        let dst = temp_dir.path().join("dst.bin");
        let data = patterned(1024 * 1024);
        fs::write(&src, &data).expect("Failed to write source");
        fs::write(&dst, &data).expect("Failed to write destination");

        let verdict = compare_files(&src, &dst, "src.bin", &small_params())
            .expect("Comparison should succeed");
        assert_eq!(verdict, IntegrityVerdict::Match);

        let fp = fingerprint_file(&src, "src.bin", &small_params()).unwrap();
        assert!(fp.sampled);
        assert_eq!(fp.bytes_hashed, 4 * 4096);
    }

    #[test]
    fn test_truncated_destination_is_size_mismatch() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src.bin");
        let dst = temp_dir.path().join("dst.bin");
        let data = patterned(100_000);
        fs::write(&src, &data).expect("Failed to write source");
        fs::write(&dst, &data[..50_000]).expect("Failed to write destination");

        let verdict = compare_files(&src, &dst, "a.bin", &small_params()).unwrap();
        assert_eq!(
            verdict,
            IntegrityVerdict::SizeMismatch {
                source: 100_000,
                destination: 50_000
            }
        );
    }

    #[test]
    fn test_change_inside_sampled_block_is_detected() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src.bin");
        let dst = temp_dir.path().join("dst.bin");
        let params = small_params();
        let data = patterned(1024 * 1024);
        fs::write(&src, &data).expect("Failed to write source");

        let offsets = sample_offsets("a.bin", data.len() as u64, &params).unwrap();
        let mut changed = data.clone();
        changed[offsets[0] as usize + 7] ^= 0xff;
        fs::write(&dst, &changed).expect("Failed to write destination");

        let verdict = compare_files(&src, &dst, "a.bin", &params).unwrap();
        assert_eq!(verdict, IntegrityVerdict::ContentMismatch);
    }

    #[test]
    fn test_change_outside_samples_is_not_read() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src.bin");
        let dst = temp_dir.path().join("dst.bin");
        let params = small_params();
        let data = patterned(1024 * 1024);
        fs::write(&src, &data).expect("Failed to write source");

        let offsets = sample_offsets("a.bin", data.len() as u64, &params).unwrap();
        let untouched = (0..data.len())
            .find(|pos| {
                !offsets
                    .iter()
                    .any(|o| (*pos as u64) >= *o && (*pos as u64) < o + params.block_size)
            })
            .expect("some byte lies outside the samples");
        let mut changed = data.clone();
        changed[untouched] ^= 0xff;
        fs::write(&dst, &changed).expect("Failed to write destination");

        let verdict = compare_files(&src, &dst, "a.bin", &params).unwrap();
        assert_eq!(verdict, IntegrityVerdict::Match);
    }

    #[test]
    fn test_same_size_small_files_with_different_content() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src.txt");
        let dst = temp_dir.path().join("dst.txt");
        fs::write(&src, b"source content").expect("Failed to write source");
        fs::write(&dst, b"source CONTENT").expect("Failed to write destination");

        let params = SampleParams {
            algorithm: FingerprintAlgorithm::Blake3,
            ..SampleParams::default()
        };
        let verdict = compare_files(&src, &dst, "x.txt", &params).unwrap();
        assert_eq!(verdict, IntegrityVerdict::ContentMismatch);
    }

    #[test]
    fn test_missing_destination_is_an_error() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src.txt");
        fs::write(&src, b"x").expect("Failed to write source");

        let result = compare_files(&src, &temp_dir.path().join("gone"), "x", &small_params());
        assert!(matches!(result, Err(EngineError::ReadError { .. })));
    }

    proptest! {
        #[test]
        fn prop_offsets_stay_aligned_unique_and_in_bounds(
            size in 1u64..(1u64 << 40),
            count in 1usize..32,
            block_kib in 1u64..128,
            rel in "[a-z]{1,6}/[a-z]{1,6}\\.bin",
        ) {
            let params = SampleParams {
                block_count: count,
                block_size: block_kib * 1024,
                algorithm: FingerprintAlgorithm::Sha256,
            };
            if let Some(offsets) = sample_offsets(&rel, size, &params) {
                prop_assert!(!offsets.is_empty());
                prop_assert!(offsets.len() <= count);
                prop_assert!(offsets.windows(2).all(|w| w[0] < w[1]));
                for offset in offsets {
                    prop_assert_eq!(offset % SAMPLE_ALIGNMENT, 0);
                    prop_assert!(offset + params.block_size <= size);
                }
            } else {
                prop_assert!(size <= params.budget());
            }
        }
    }
}
