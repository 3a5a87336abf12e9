use std::cmp;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Random-offset piece storage over one sparse file.
///
/// Peer `p`'s copy of the shared file lives at `<base>/peer_<p>/<name>`;
/// piece `i` occupies byte offset `i * piece_size`, the final piece possibly
/// shorter. The handle is opened lazily and kept for the process lifetime.
pub struct PieceFile {
    path: PathBuf,
    piece_size: u64,
    file_size: u64,
    handle: Option<File>,
}

impl PieceFile {
    pub fn new(
        base_path: &Path,
        peer_id: u32,
        file_name: &str,
        file_size: u64,
        piece_size: u64,
    ) -> Self {
        PieceFile {
            path: base_path.join(format!("peer_{peer_id}")).join(file_name),
            piece_size,
            file_size,
            handle: None,
        }
    }

    /// Length in bytes of piece `piece_idx`, accounting for the short tail.
    pub fn piece_len(&self, piece_idx: usize) -> u64 {
        cmp::min(
            self.piece_size,
            self.file_size - piece_idx as u64 * self.piece_size,
        )
    }

    pub fn read_piece(&mut self, piece_idx: usize) -> io::Result<Vec<u8>> {
        let len = self.piece_len(piece_idx);
        let offset = piece_idx as u64 * self.piece_size;
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0; len as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Persists `data` at the piece's offset. Data beyond the piece's length
    /// (a full-size buffer delivered for the short final piece) is clamped
    /// at the file boundary.
    pub fn write_piece(&mut self, piece_idx: usize, data: &[u8]) -> io::Result<()> {
        let len = cmp::min(data.len() as u64, self.piece_len(piece_idx)) as usize;
        let offset = piece_idx as u64 * self.piece_size;
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&data[..len])?;
        Ok(())
    }

    /// SHA-256 over the entire persisted file.
    pub fn sha256(&mut self) -> io::Result<[u8; 32]> {
        let file = self.file()?;
        file.seek(SeekFrom::Start(0))?;
        let mut hasher = Sha256::new();
        let mut chunk = vec![0; HASH_CHUNK_SIZE];
        loop {
            let n = file.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            hasher.update(&chunk[..n]);
        }
        Ok(hasher.finalize().into())
    }

    fn file(&mut self) -> io::Result<&mut File> {
        if self.handle.is_none() {
            if let Some(dir) = self.path.parent() {
                fs::create_dir_all(dir)?;
            }
            let f = File::options()
                .read(true)
                .write(true)
                .create(true)
                .open(&self.path)?;
            self.handle = Some(f);
        }
        Ok(self.handle.as_mut().expect("opened above"))
    }
}
