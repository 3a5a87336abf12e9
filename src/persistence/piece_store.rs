use std::path::Path;
use std::sync::Mutex;

use anyhow::{bail, Result};

use crate::persistence::piece_file::PieceFile;
use crate::swarm_protocol::tcp_wire_protocol::pack_bits;

/// Piece ownership bitmap plus the persisted payload behind it.
///
/// The bitmap and the backing file form one critical section: every
/// mark-owned + write pair runs under a single lock so that concurrent piece
/// deliveries from different sessions cannot interleave a partial write with
/// a bitmap flip, and `is_complete` always observes a consistent snapshot.
pub struct PieceStore {
    num_pieces: usize,
    expected_sha256: Option<[u8; 32]>,
    inner: Mutex<StoreInner>,
}

struct StoreInner {
    have: Vec<bool>,
    backing: PieceFile,
}

impl PieceStore {
    pub fn new(
        base_path: &Path,
        peer_id: u32,
        file_name: &str,
        file_size: u64,
        piece_size: u64,
        has_full_file: bool,
        expected_sha256: Option<[u8; 32]>,
    ) -> Self {
        let num_pieces = file_size.div_ceil(piece_size) as usize;
        PieceStore {
            num_pieces,
            expected_sha256,
            inner: Mutex::new(StoreInner {
                have: vec![has_full_file; num_pieces],
                backing: PieceFile::new(base_path, peer_id, file_name, file_size, piece_size),
            }),
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    pub fn has_piece(&self, piece_idx: usize) -> bool {
        let inner = self.lock();
        piece_idx < self.num_pieces && inner.have[piece_idx]
    }

    pub fn is_complete(&self) -> bool {
        self.lock().have.iter().all(|have| *have)
    }

    /// Snapshot of the ownership bitmap; never a live view.
    pub fn bitmap(&self) -> Vec<bool> {
        self.lock().have.clone()
    }

    /// The bitmap packed for the wire: `ceil(N/8)` bytes, the high bit of
    /// the first byte being piece 0, padding bits zero.
    pub fn bitfield_bytes(&self) -> Vec<u8> {
        pack_bits(&self.lock().have)
    }

    pub fn piece_bytes(&self, piece_idx: usize) -> Result<Vec<u8>> {
        let mut inner = self.lock();
        if piece_idx >= self.num_pieces {
            bail!(
                "requested piece idx {piece_idx} out of range (total pieces: {})",
                self.num_pieces
            );
        }
        if !inner.have[piece_idx] {
            bail!("requested piece idx {piece_idx} that we don't have");
        }
        Ok(inner.backing.read_piece(piece_idx)?)
    }

    /// Marks piece `piece_idx` owned and persists `data` at its offset, as
    /// one critical section. Safe to call concurrently for different or the
    /// same index (same-index races are last-writer-wins, the content being
    /// identical). Returns true when this call completed the file.
    pub fn store_piece(&self, piece_idx: usize, data: &[u8]) -> Result<bool> {
        let mut inner = self.lock();
        if piece_idx >= self.num_pieces {
            bail!(
                "piece idx {piece_idx} out of range (total pieces: {})",
                self.num_pieces
            );
        }
        if inner.have[piece_idx] {
            log::debug!("we already have piece {piece_idx}, avoiding rewrite");
            return Ok(false);
        }
        inner.have[piece_idx] = true;
        inner.backing.write_piece(piece_idx, data)?;
        Ok(inner.have.iter().all(|have| *have))
    }

    /// Digests the whole persisted file and compares against the configured
    /// constant. Informational: callers log the outcome, nothing gates on it.
    pub fn verify_file_hash(&self) -> bool {
        let expected = match self.expected_sha256 {
            Some(expected) => expected,
            None => {
                log::debug!("no expected file digest configured, skipping verification");
                return true;
            }
        };
        let mut inner = self.lock();
        match inner.backing.sha256() {
            Ok(actual) => {
                if actual == expected {
                    true
                } else {
                    log::warn!(
                        "file digest mismatch: expected {}, got {}",
                        hex::encode(expected),
                        hex::encode(actual)
                    );
                    false
                }
            }
            Err(e) => {
                log::error!("could not digest persisted file: {e}");
                false
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner
            .lock()
            .expect("another user panicked while holding the lock")
    }
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::path::PathBuf;

    use sha2::{Digest, Sha256};

    use super::*;

    fn test_base(name: &str) -> PathBuf {
        let base = env::temp_dir().join(format!("fileswarm_store_{name}_{}", std::process::id()));
        let _ = fs::remove_dir_all(&base);
        base
    }

    fn empty_store(name: &str, file_size: u64, piece_size: u64) -> PieceStore {
        PieceStore::new(
            &test_base(name),
            1002,
            "shared.dat",
            file_size,
            piece_size,
            false,
            None,
        )
    }

    #[test]
    fn bitfield_bytes_length_and_order() {
        // 9 pieces of 2 bytes each -> 2 bitfield bytes
        let store = empty_store("bitfield", 18, 2);
        assert_eq!(store.num_pieces(), 9);
        store.store_piece(0, b"aa").unwrap();
        store.store_piece(8, b"bb").unwrap();
        assert_eq!(store.bitfield_bytes(), vec![0b10000000, 0b10000000]);
        assert_eq!(store.bitfield_bytes().len(), 2);
        for i in 0..9 {
            assert_eq!(store.has_piece(i), i == 0 || i == 8);
            assert_eq!(store.bitmap()[i], i == 0 || i == 8);
        }
    }

    #[test]
    fn store_then_read_back() {
        let store = empty_store("read_back", 12, 4);
        assert!(!store.has_piece(1));
        store.store_piece(1, b"abcd").unwrap();
        assert!(store.has_piece(1));
        assert_eq!(store.piece_bytes(1).unwrap(), b"abcd");
    }

    #[test]
    fn short_final_piece() {
        // 10 bytes in 4-byte pieces: lengths 4, 4, 2
        let store = empty_store("short_tail", 10, 4);
        assert_eq!(store.num_pieces(), 3);
        assert!(!store.store_piece(0, b"aaaa").unwrap());
        assert!(!store.store_piece(1, b"bbbb").unwrap());
        // a full-size buffer for the final piece is clamped at the boundary
        let became_complete = store.store_piece(2, b"cc__").unwrap();
        assert!(became_complete);
        assert!(store.is_complete());
        assert_eq!(store.piece_bytes(2).unwrap(), b"cc");
    }

    #[test]
    fn seed_is_complete_without_stores() {
        let store = PieceStore::new(
            &test_base("seed"),
            1001,
            "shared.dat",
            10,
            4,
            true,
            None,
        );
        assert!(store.is_complete());
        assert_eq!(store.bitfield_bytes(), vec![0b11100000]);
    }

    #[test]
    fn missing_piece_read_fails() {
        let store = empty_store("missing", 8, 4);
        assert!(store.piece_bytes(0).is_err());
        assert!(store.piece_bytes(99).is_err());
    }

    #[test]
    fn already_stored_piece_is_not_rewritten() {
        let store = empty_store("rewrite", 8, 4);
        store.store_piece(0, b"aaaa").unwrap();
        assert!(!store.store_piece(0, b"zzzz").unwrap());
        assert_eq!(store.piece_bytes(0).unwrap(), b"aaaa");
    }

    #[test]
    fn whole_file_hash_verification() {
        let content = b"0123456789";
        let expected: [u8; 32] = Sha256::digest(content).into();
        let base = test_base("verify");
        let store = PieceStore::new(&base, 1002, "shared.dat", 10, 4, false, Some(expected));
        store.store_piece(0, &content[0..4]).unwrap();
        store.store_piece(1, &content[4..8]).unwrap();
        store.store_piece(2, &content[8..10]).unwrap();
        assert!(store.verify_file_hash());

        let bad = PieceStore::new(&base, 1002, "shared.dat", 10, 4, true, Some([0u8; 32]));
        assert!(!bad.verify_file_hash());
    }

    #[test]
    fn verification_skipped_without_expected_digest() {
        let store = empty_store("no_digest", 8, 4);
        assert!(store.verify_file_hash());
    }
}
