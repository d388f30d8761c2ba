use super::*;
use crate::store::FileInfo;

fn sha1(data: &[u8]) -> [u8; 20] {
    use sha1::Digest;
    let mut hasher = sha1::Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn single_file_store(dir: &Path, total_len: usize, piece_len: usize) -> StoreInfo {
    let num_pieces = ((total_len + piece_len - 1) / piece_len) as u32;
    let last_piece_len = total_len - piece_len * (num_pieces as usize - 1);
    StoreInfo {
        total_len: total_len as u64,
        piece_len,
        last_piece_len,
        num_pieces,
        files: vec![FileInfo {
            path: PathBuf::from("content.bin"),
            length: total_len,
            offset: 0,
            md5sum: None,
        }],
        output_dir: dir.to_path_buf(),
    }
}

#[tokio::test]
async fn two_peer_handoff() {
    let dir = tempfile::tempdir().unwrap();
    let piece_len = 524_288;
    let total_len = 1_572_863; // three pieces, last one short by one byte
    let content: Vec<u8> = (0..total_len).map(|i| (i % 251) as u8).collect();
    let pieces: Vec<&[u8]> = content.chunks(piece_len).collect();
    assert_eq!(pieces.len(), 3);
    let hashes: Vec<[u8; 20]> = pieces.iter().map(|p| sha1(p)).collect();

    let info = single_file_store(dir.path(), total_len, piece_len);
    let manager = PieceManager::new(info, hashes);

    let mut bitfield_history = Vec::new();
    bitfield_history.push(manager.get_bitfield().await.count_ones());

    for (idx, piece) in pieces.iter().enumerate() {
        assert!(manager.submit_block(idx, 0, piece.to_vec()).await.unwrap());
        bitfield_history.push(manager.get_bitfield().await.count_ones());
    }

    assert_eq!(bitfield_history, vec![0, 1, 2, 3]);
    assert!(manager.is_complete().await);
    assert_eq!(manager.downloaded().await, total_len as u64);

    for (idx, piece) in pieces.iter().enumerate() {
        let read_back = manager.read_piece(idx).await.unwrap().unwrap();
        assert_eq!(&read_back, piece);
    }

    let target = tempfile::tempdir().unwrap();
    manager.reconstruct(target.path()).await.unwrap();
    let written = std::fs::read(target.path().join("content.bin")).unwrap();
    assert_eq!(written, content);
}

#[tokio::test]
async fn hash_mismatch_discards_piece() {
    let dir = tempfile::tempdir().unwrap();
    let piece_len = 16;
    let good = vec![7u8; piece_len];
    let mut corrupt = good.clone();
    corrupt[0] ^= 0xFF;

    let info = single_file_store(dir.path(), piece_len, piece_len);
    let manager = PieceManager::new(info, vec![sha1(&good)]);

    let verified = manager.submit_block(0, 0, corrupt).await.unwrap();
    assert!(!verified);
    assert!(!manager.is_complete().await);
    assert_eq!(manager.downloaded().await, 0);
    assert_eq!(manager.rarest_missing().await, vec![0]);
}

#[tokio::test]
async fn block_grid_reassembles_out_of_order() {
    let dir = tempfile::tempdir().unwrap();
    let piece_len = BLOCK_SIZE * 2 + 100;
    let data: Vec<u8> = (0..piece_len).map(|i| (i % 255) as u8).collect();
    let info = single_file_store(dir.path(), piece_len, piece_len);
    let manager = PieceManager::new(info, vec![sha1(&data)]);

    // Deliver the final short block first, then the two full blocks.
    assert!(!manager
        .submit_block(0, BLOCK_SIZE * 2, data[BLOCK_SIZE * 2..].to_vec())
        .await
        .unwrap());
    assert!(!manager
        .submit_block(0, BLOCK_SIZE, data[BLOCK_SIZE..BLOCK_SIZE * 2].to_vec())
        .await
        .unwrap());
    assert!(manager.submit_block(0, 0, data[..BLOCK_SIZE].to_vec()).await.unwrap());

    let read_back = manager.read_piece(0).await.unwrap().unwrap();
    assert_eq!(read_back, data);
}

#[tokio::test]
async fn availability_accounting_bitfield_have_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let info = single_file_store(dir.path(), 4 * 10, 10);
    let manager = PieceManager::new(info, vec![[0u8; 20]; 4]);

    let peer = [1u8; 20];
    let mut bitfield = Bitfield::repeat(false, 4);
    bitfield.set(0, true);
    bitfield.set(2, true);
    manager.observe_bitfield(peer, &bitfield).await;

    manager.observe_have(peer, 1).await;

    // Re-observing the same bitfield must not double-count.
    manager.observe_bitfield(peer, &bitfield).await;

    let availability_before = manager.rarest_missing().await;
    assert_eq!(availability_before, vec![3, 0, 1, 2]);

    manager.forget_peer(peer).await;
    let availability_after = manager.rarest_missing().await;
    assert_eq!(availability_after, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn multi_file_reconstruction() {
    let work_dir = tempfile::tempdir().unwrap();
    let piece_len = 8;
    let total_len = 30;
    let content: Vec<u8> = (0..total_len as u8).collect();
    let files = vec![
        FileInfo { path: PathBuf::from("a.bin"), length: 10, offset: 0, md5sum: None },
        FileInfo {
            path: PathBuf::from("d").join("b.bin"),
            length: 20,
            offset: 10,
            md5sum: None,
        },
    ];
    let num_pieces = ((total_len + piece_len - 1) / piece_len) as u32;
    let last_piece_len = total_len - piece_len * (num_pieces as usize - 1);
    let info = StoreInfo {
        total_len: total_len as u64,
        piece_len,
        last_piece_len,
        num_pieces,
        files,
        output_dir: work_dir.path().to_path_buf(),
    };

    let hashes: Vec<[u8; 20]> = content.chunks(piece_len).map(sha1).collect();
    let manager = PieceManager::new(info, hashes);

    for (idx, piece) in content.chunks(piece_len).enumerate() {
        manager.submit_block(idx, 0, piece.to_vec()).await.unwrap();
    }
    assert!(manager.is_complete().await);

    let target = tempfile::tempdir().unwrap();
    manager.reconstruct(target.path()).await.unwrap();

    let a = std::fs::read(target.path().join("a.bin")).unwrap();
    assert_eq!(a, content[0..10]);
    let b = std::fs::read(target.path().join("d").join("b.bin")).unwrap();
    assert_eq!(b, content[10..30]);
}

#[tokio::test]
async fn load_existing_resumes_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let piece_len = 12;
    let content: Vec<u8> = (0..piece_len as u8).collect();
    std::fs::write(dir.path().join("content.bin"), &content).unwrap();

    let info = single_file_store(dir.path(), piece_len, piece_len);
    let manager = PieceManager::new(info, vec![sha1(&content)]);

    manager.load_existing().await.unwrap();
    assert!(manager.is_complete().await);
    assert_eq!(manager.downloaded().await, piece_len as u64);
}
