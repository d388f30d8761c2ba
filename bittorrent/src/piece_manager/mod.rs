use std::{
    collections::{HashMap, HashSet},
    io::{Read, Seek, SeekFrom, Write},
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::Mutex;
use crate::{block, store::StoreInfo, Bitfield, BLOCK_SIZE};

#[cfg(test)]
mod tests;

// Identifies a peer for availability/attribution bookkeeping. We key on the
// remote peer id captured at handshake time rather than the socket address,
// so availability survives a reconnect from the same peer on a new port.
pub type PeerId = [u8; 20];

#[derive(Debug, thiserror::Error)]
pub enum PieceManagerError {

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("piece index {0} out of bounds")]
    InvalidIndex(usize),

    #[error("invalid block for piece {index}: begin {begin}, len {len}")]
    InvalidBlock { index: usize, begin: usize, len: usize },
}

type Result<T> = std::result::Result<T, PieceManagerError>;

// Read-cache capacity: a handful of recently-verified or recently-served
// pieces, enough to answer a burst of requests from several peers without
// re-reading disk for every block. Grounded in the teacher's disk-task cache.
const READ_CACHE_CAPACITY: usize = 32;

struct InFlightPiece {
    buffer: Vec<u8>,
    // One flag per block in the piece's expected block grid.
    received: Vec<bool>,
}

impl InFlightPiece {
    fn new(piece_len: usize) -> Self {
        Self {
            buffer: vec![0u8; piece_len],
            received: vec![false; block::num_blocks(piece_len) as usize],
        }
    }

    // Last write wins per byte; a block-grid cell is marked received only
    // once a deposit has covered its whole range.
    fn deposit(&mut self, begin: usize, data: &[u8]) {
        let piece_len = self.buffer.len();
        let end = (begin + data.len()).min(piece_len);
        self.buffer[begin..end].copy_from_slice(&data[..end - begin]);

        let start_block = begin / BLOCK_SIZE;
        let end_block = if end == 0 { 0 } else { (end - 1) / BLOCK_SIZE };
        for b in start_block..=end_block {
            let block_start = b * BLOCK_SIZE;
            let block_end = block_start + block::block_len(piece_len, b);
            if begin <= block_start && end >= block_end {
                self.received[b] = true;
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.received.iter().all(|r| *r)
    }
}

struct PieceManagerState {
    verified: Bitfield,
    in_flight: HashMap<usize, InFlightPiece>,
    requested_pieces: HashSet<usize>,
    piece_availability: Vec<usize>,
    peer_piece_map: HashMap<PeerId, HashSet<usize>>,
    downloaded: u64,
    uploaded: u64,
    read_cache: lru::LruCache<usize, Arc<Vec<u8>>>,
}

// Hash-verified, partially-ordered storage for the pieces of a single
// torrent. Peer sessions hold this behind a shared `Arc` and call it
// directly; every mutating (and most reading) operation takes the one
// internal mutex. Blocking file IO is offloaded to `spawn_blocking` so the
// lock is held across an await point, not across a thread-blocking syscall.
pub struct PieceManager {
    info: StoreInfo,
    piece_hashes: Vec<[u8; 20]>,
    state: Mutex<PieceManagerState>,
}

impl PieceManager {
    pub fn new(info: StoreInfo, piece_hashes: Vec<[u8; 20]>) -> Arc<Self> {
        let num_pieces = info.num_pieces as usize;
        Arc::new(Self {
            piece_hashes,
            state: Mutex::new(PieceManagerState {
                verified: Bitfield::repeat(false, num_pieces),
                in_flight: HashMap::new(),
                requested_pieces: HashSet::new(),
                piece_availability: vec![0; num_pieces],
                peer_piece_map: HashMap::new(),
                downloaded: 0,
                uploaded: 0,
                read_cache: lru::LruCache::new(NonZeroUsize::new(READ_CACHE_CAPACITY).unwrap()),
            }),
            info,
        })
    }

    pub fn info(&self) -> &StoreInfo {
        &self.info
    }

    pub async fn downloaded(&self) -> u64 {
        self.state.lock().await.downloaded
    }

    pub async fn uploaded(&self) -> u64 {
        self.state.lock().await.uploaded
    }

    // Scans the file layout for complete, correctly-hashed pieces already
    // present on disk and marks them verified. Used by seeders at startup
    // and by resuming leechers.
    pub async fn load_existing(&self) -> Result<()> {
        for index in 0..self.info.num_pieces as usize {
            let info = self.info.clone();
            let dir = self.info.output_dir.clone();
            let bytes = tokio::task::spawn_blocking(move || read_piece_region(&info, &dir, index))
                .await
                .expect("disk reader task panicked")?;
            let Some(bytes) = bytes else { continue };

            if hash_matches(&bytes, &self.piece_hashes[index]) {
                let mut state = self.state.lock().await;
                if !state.verified[index] {
                    state.verified.set(index, true);
                    state.downloaded += bytes.len() as u64;
                }
                state.read_cache.put(index, Arc::new(bytes));
                tracing::debug!(piece = index, "loaded existing piece from disk");
            }
        }
        Ok(())
    }

    // Deposits a block. Returns whether the piece is verified after this
    // call (true both when this call completed it and when it was already
    // verified beforehand).
    pub async fn submit_block(&self, index: usize, begin: usize, data: Vec<u8>) -> Result<bool> {
        if index >= self.info.num_pieces as usize {
            return Err(PieceManagerError::InvalidIndex(index));
        }
        let piece_len = self.info.piece_length(index);
        if begin > piece_len || begin + data.len() > piece_len {
            return Err(PieceManagerError::InvalidBlock { index, begin, len: data.len() });
        }

        let mut guard = self.state.lock().await;
        if guard.verified[index] {
            // Idempotent: piece already verified, later blocks are ignored.
            return Ok(true);
        }

        let piece = guard.in_flight.entry(index).or_insert_with(|| InFlightPiece::new(piece_len));
        piece.deposit(begin, &data);

        if !piece.is_complete() {
            return Ok(false);
        }

        let buffer = guard.in_flight.remove(&index).unwrap().buffer;
        if !hash_matches(&buffer, &self.piece_hashes[index]) {
            tracing::warn!(piece = index, "hash mismatch, discarding piece");
            return Ok(false);
        }

        let info = self.info.clone();
        let dir = self.info.output_dir.clone();
        let to_write = buffer.clone();
        tokio::task::spawn_blocking(move || write_piece_region(&info, &dir, index, &to_write))
            .await
            .expect("disk writer task panicked")?;

        guard.verified.set(index, true);
        guard.requested_pieces.remove(&index);
        guard.downloaded += piece_len as u64;
        guard.read_cache.put(index, Arc::new(buffer));
        tracing::info!(piece = index, "piece verified");
        Ok(true)
    }

    pub async fn read_piece(&self, index: usize) -> Result<Option<Vec<u8>>> {
        if index >= self.info.num_pieces as usize {
            return Err(PieceManagerError::InvalidIndex(index));
        }
        let mut state = self.state.lock().await;
        if !state.verified[index] {
            return Ok(None);
        }
        if let Some(cached) = state.read_cache.get(&index) {
            return Ok(Some((**cached).clone()));
        }

        let info = self.info.clone();
        let dir = self.info.output_dir.clone();
        let bytes = tokio::task::spawn_blocking(move || read_piece_region(&info, &dir, index))
            .await
            .expect("disk reader task panicked")?
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "verified piece missing on disk")
            })?;
        state.read_cache.put(index, Arc::new(bytes.clone()));
        Ok(Some(bytes))
    }

    pub async fn read_block(&self, index: usize, begin: usize, length: usize) -> Result<Option<Vec<u8>>> {
        let Some(piece) = self.read_piece(index).await? else { return Ok(None) };
        if begin > piece.len() {
            return Err(PieceManagerError::InvalidBlock { index, begin, len: length });
        }
        let end = (begin + length).min(piece.len());
        let slice = piece[begin..end].to_vec();
        self.state.lock().await.uploaded += slice.len() as u64;
        Ok(Some(slice))
    }

    pub async fn get_bitfield(&self) -> Bitfield {
        self.state.lock().await.verified.clone()
    }

    pub async fn observe_bitfield(&self, peer: PeerId, bitfield: &Bitfield) {
        let mut state = self.state.lock().await;
        let mut newly_seen = Vec::new();
        {
            let held = state.peer_piece_map.entry(peer).or_default();
            for i in bitfield.iter_ones() {
                if held.insert(i) {
                    newly_seen.push(i);
                }
            }
        }
        for i in newly_seen {
            state.piece_availability[i] += 1;
        }
    }

    pub async fn observe_have(&self, peer: PeerId, index: usize) {
        let mut state = self.state.lock().await;
        let newly_seen = state.peer_piece_map.entry(peer).or_default().insert(index);
        if newly_seen {
            state.piece_availability[index] += 1;
        }
    }

    pub async fn forget_peer(&self, peer: PeerId) {
        let mut state = self.state.lock().await;
        if let Some(pieces) = state.peer_piece_map.remove(&peer) {
            for i in pieces {
                if state.piece_availability[i] > 0 {
                    state.piece_availability[i] -= 1;
                }
            }
        }
    }

    pub async fn mark_requested(&self, index: usize) {
        self.state.lock().await.requested_pieces.insert(index);
    }

    pub async fn unmark_requested(&self, index: usize) {
        self.state.lock().await.requested_pieces.remove(&index);
    }

    // Absent pieces not currently pending, sorted ascending by availability.
    // A piece becomes unavailable to this query the moment it is marked
    // requested, and reappears once the coordinator's timeout sweeper
    // unmarks it - `requested_pieces` stands in for the absent/in-flight
    // split the data model describes, since at most one session is ever
    // assembling a given piece at a time in this implementation.
    pub async fn rarest_missing(&self) -> Vec<usize> {
        let state = self.state.lock().await;
        let mut indices: Vec<usize> = (0..self.info.num_pieces as usize)
            .filter(|i| !state.verified[*i] && !state.requested_pieces.contains(i))
            .collect();
        indices.sort_by_key(|i| state.piece_availability[*i]);
        indices
    }

    // Current `A[i]`, the number of connected peers known to hold this piece.
    pub async fn availability(&self, index: usize) -> usize {
        self.state.lock().await.piece_availability[index]
    }

    pub async fn is_complete(&self) -> bool {
        self.state.lock().await.verified.all()
    }

    // Materializes every verified piece's bytes into `base_dir`'s file
    // layout. `base_dir` need not be the directory pieces were written to
    // as they completed - this is what makes the load_existing/reconstruct
    // round trip meaningful.
    pub async fn reconstruct(&self, base_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(base_dir)?;
        for index in 0..self.info.num_pieces as usize {
            let Some(bytes) = self.read_piece(index).await? else { continue };
            let info = self.info.clone();
            let dir = base_dir.to_path_buf();
            tokio::task::spawn_blocking(move || write_piece_region(&info, &dir, index, &bytes))
                .await
                .expect("disk writer task panicked")?;
        }
        Ok(())
    }
}

fn hash_matches(data: &[u8], expected: &[u8; 20]) -> bool {
    use sha1::Digest;
    let mut hasher = sha1::Sha1::new();
    hasher.update(data);
    let digest: [u8; 20] = hasher.finalize().into();
    &digest == expected
}

// Writes `data` (one whole piece) into the files it spans under `dir`,
// creating parent directories and files as needed.
fn write_piece_region(info: &StoreInfo, dir: &Path, index: usize, data: &[u8]) -> std::io::Result<()> {
    let piece_offset = info.piece_byte_offset(index);
    let span = info.piece_file_intersections(index);
    let mut consumed = 0usize;

    for file in &info.files[span] {
        let file_start = piece_offset + consumed;
        let in_file_offset = file_start - file.offset;
        let available = file.length - in_file_offset;
        let take = available.min(data.len() - consumed);

        let path = dir.join(&file.path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut handle = std::fs::OpenOptions::new().create(true).write(true).open(&path)?;
        handle.seek(SeekFrom::Start(in_file_offset as u64))?;
        handle.write_all(&data[consumed..consumed + take])?;

        consumed += take;
    }

    Ok(())
}

// Reads the region for `index` out of the files it spans under `dir`.
// Returns `Ok(None)` (rather than erroring) when a file is missing or
// shorter than the piece requires - the ordinary state for a piece that
// hasn't been downloaded yet.
fn read_piece_region(info: &StoreInfo, dir: &Path, index: usize) -> std::io::Result<Option<Vec<u8>>> {
    let piece_len = info.piece_length(index);
    let piece_offset = info.piece_byte_offset(index);
    let span = info.piece_file_intersections(index);
    let mut out = vec![0u8; piece_len];
    let mut consumed = 0usize;

    for file in &info.files[span] {
        let file_start = piece_offset + consumed;
        let in_file_offset = file_start - file.offset;
        let available = file.length - in_file_offset;
        let take = available.min(piece_len - consumed);

        let path = dir.join(&file.path);
        let mut handle = match std::fs::File::open(&path) {
            Ok(handle) => handle,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        handle.seek(SeekFrom::Start(in_file_offset as u64))?;
        if let Err(e) = handle.read_exact(&mut out[consumed..consumed + take]) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Ok(None);
            }
            return Err(e);
        }

        consumed += take;
    }

    Ok(Some(out))
}
