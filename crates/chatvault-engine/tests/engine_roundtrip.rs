//! End-to-end engine tests over the in-memory transport: split/upload,
//! download/reassembly, pause/resume, cancel, and integrity handling.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chatvault_catalog::Catalog;
use chatvault_engine::{
    ControlRegistry, DownloadEngine, NullSink, TransferOutcome, UploadEngine, UploadOptions,
};
use chatvault_transport::{CredentialPool, MemoryTransport, Transport, TransportError};
use chatvault_types::{ErrorKind, FileCategory, TransferSettings, TransferState};

const CHUNK: u64 = 4096;

struct Harness {
    _dir: tempfile::TempDir,
    catalog: Arc<Catalog>,
    transport: Arc<MemoryTransport>,
    controls: Arc<ControlRegistry>,
    upload: Arc<UploadEngine>,
    download: Arc<DownloadEngine>,
    root: PathBuf,
}

fn test_settings() -> TransferSettings {
    TransferSettings {
        chunk_size: CHUNK,
        chunk_threshold: CHUNK,
        max_parallel_chunks: 2,
        max_retries_per_chunk: 3,
        retry_backoff: Duration::from_millis(1),
    }
}

fn harness_with(tokens: &[&str]) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let catalog = Arc::new(Catalog::create(&root.join("catalog.db"), "pw").unwrap());
    let transport = Arc::new(MemoryTransport::new());
    let pool = Arc::new(CredentialPool::from_tokens(tokens.iter().copied()).unwrap());
    let controls = Arc::new(ControlRegistry::new());
    let sink = Arc::new(NullSink);

    let upload = Arc::new(UploadEngine::new(
        catalog.clone(),
        transport.clone() as Arc<dyn Transport>,
        pool.clone(),
        controls.clone(),
        sink.clone(),
        test_settings(),
        "chat-1",
    ));
    let download = Arc::new(DownloadEngine::new(
        catalog.clone(),
        transport.clone() as Arc<dyn Transport>,
        pool,
        controls.clone(),
        sink,
        test_settings(),
        root.join("scratch"),
    ));
    Harness {
        _dir: dir,
        catalog,
        transport,
        controls,
        upload,
        download,
        root,
    }
}

fn harness() -> Harness {
    harness_with(&["tok-a", "tok-b"])
}

fn write_source(root: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = root.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

/// Pseudo-random bytes from a fixed seed, no RNG dependency needed.
fn patterned(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed;
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

/// Arm slot for transport-hook tripwires. The hook waits until the test has
/// stored the operation id, which happens right after `start()` returns, so
/// the trip point is deterministic: the flag is set during the `trip_at`-th
/// transport call.
type ArmSlot = Arc<Mutex<Option<String>>>;

fn await_armed(slot: &ArmSlot) -> String {
    loop {
        if let Some(id) = slot.lock().unwrap().clone() {
            return id;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn trip_sends(h: &Harness, trip_at: u64, cancel: bool) -> ArmSlot {
    let slot: ArmSlot = Arc::new(Mutex::new(None));
    let hook_slot = slot.clone();
    let controls = h.controls.clone();
    h.transport.on_send(move |n| {
        if n == trip_at {
            let id = await_armed(&hook_slot);
            if cancel {
                controls.cancel(&id);
            } else {
                controls.pause(&id);
            }
        }
    });
    slot
}

fn trip_fetches(h: &Harness, trip_at: u64, cancel: bool) -> ArmSlot {
    let slot: ArmSlot = Arc::new(Mutex::new(None));
    let hook_slot = slot.clone();
    let controls = h.controls.clone();
    h.transport.on_fetch(move |n| {
        if n == trip_at {
            let id = await_armed(&hook_slot);
            if cancel {
                controls.cancel(&id);
            } else {
                controls.pause(&id);
            }
        }
    });
    slot
}

#[test]
fn small_file_takes_direct_path_and_round_trips() {
    let h = harness();
    let payload = vec![0x41u8; 1000];
    let source = write_source(&h.root, "small.txt", &payload);

    let record = h
        .upload
        .direct_upload(&source, &UploadOptions::default())
        .unwrap();
    assert_eq!(record.category, FileCategory::Direct);
    assert_eq!(record.size, 1000);
    assert!(record.direct_transport_id.is_some());
    assert!(h.catalog.get_chunks(&record.file_id).unwrap().is_empty());

    let dest = h.root.join("out/small.txt");
    h.download.direct_download(&record, &dest, None).unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), payload);
}

#[test]
fn exactly_one_chunk_is_still_direct() {
    // size == threshold is not strictly greater, so the routing rule keeps
    // a one-chunk-sized file on the direct path.
    let settings = test_settings();
    assert!(!settings.is_chunked(CHUNK));
    assert!(settings.is_chunked(CHUNK + 1));
}

#[test]
fn three_chunk_upload_splits_and_completes() {
    let h = harness();
    let payload = patterned(9 * 1024, 42);
    let source = write_source(&h.root, "three.bin", &payload);

    let (file_id, handle) = h.upload.start(&source, &UploadOptions::default()).unwrap();
    assert_eq!(handle.join().unwrap().unwrap(), TransferOutcome::Completed);

    let chunks = h.catalog.get_chunks(&file_id).unwrap();
    let sizes: Vec<u64> = chunks.iter().map(|c| c.size_bytes).collect();
    assert_eq!(sizes, vec![4096, 4096, 1024]);
    assert!(chunks.iter().all(|c| c.transport_id.is_some()));

    // recovery record is gone, file stays
    assert!(h.catalog.get_upload_state(&file_id).is_err());
    let record = h.catalog.get_file(&file_id).unwrap();
    assert_eq!(record.category, FileCategory::Chunked);

    // the uploaded documents concatenate back to the source
    let mut remote = Vec::new();
    for chunk in &chunks {
        remote.extend(
            h.transport
                .document(chunk.transport_id.as_ref().unwrap())
                .unwrap(),
        );
    }
    assert_eq!(remote, payload);
}

#[test]
fn chunked_download_reassembles_byte_identical() {
    let h = harness();
    let payload = patterned(3 * CHUNK as usize + 517, 7);
    let source = write_source(&h.root, "data.bin", &payload);

    let (file_id, handle) = h.upload.start(&source, &UploadOptions::default()).unwrap();
    handle.join().unwrap().unwrap();

    let dest = h.root.join("out/data.bin");
    let (download_id, handle) = h.download.start(&file_id, &dest, None).unwrap();
    assert_eq!(handle.join().unwrap().unwrap(), TransferOutcome::Completed);

    assert_eq!(std::fs::read(&dest).unwrap(), payload);
    // terminal download leaves no recovery record and no scratch directory
    assert!(h.catalog.get_download_state(&download_id).is_err());
    assert!(!h.root.join("scratch").join(&download_id).exists());
}

#[test]
fn credential_pool_is_fair_across_chunks() {
    let h = harness_with(&["a", "b", "c"]);
    let payload = patterned(9 * CHUNK as usize, 3);
    let source = write_source(&h.root, "fair.bin", &payload);

    let (_file_id, handle) = h.upload.start(&source, &UploadOptions::default()).unwrap();
    handle.join().unwrap().unwrap();

    let mut per_credential: HashMap<String, usize> = HashMap::new();
    for send in h.transport.sends() {
        *per_credential.entry(send.credential_id).or_default() += 1;
    }
    // 9 chunks over 3 credentials, strict round robin: 3 each
    assert_eq!(per_credential.len(), 3);
    assert!(
        per_credential.values().all(|&n| n == 3),
        "{per_credential:?}"
    );
}

#[test]
fn chunk_captions_carry_coordinates() {
    let h = harness();
    let payload = patterned(2 * CHUNK as usize, 11);
    let source = write_source(&h.root, "captioned.bin", &payload);

    let (_file_id, handle) = h.upload.start(&source, &UploadOptions::default()).unwrap();
    handle.join().unwrap().unwrap();

    let mut captions: Vec<String> = h
        .transport
        .sends()
        .into_iter()
        .filter_map(|s| s.caption)
        .collect();
    captions.sort();
    assert_eq!(
        captions,
        vec!["captioned.bin chunk 1/2", "captioned.bin chunk 2/2"]
    );
}

#[test]
fn pause_then_resume_completes_byte_identical() {
    let h = harness();
    let slot = trip_sends(&h, 3, false);

    let payload = patterned(20 * CHUNK as usize, 99);
    let source = write_source(&h.root, "big.bin", &payload);

    let (file_id, handle) = h.upload.start(&source, &UploadOptions::default()).unwrap();
    *slot.lock().unwrap() = Some(file_id.clone());
    let outcome = handle.join().unwrap().unwrap();
    assert_eq!(outcome, TransferOutcome::Paused);

    let incomplete = h.catalog.list_incomplete_uploads().unwrap();
    assert_eq!(incomplete.len(), 1);
    assert_eq!(incomplete[0].state, TransferState::Paused);
    assert!(incomplete[0].completed_chunks >= 3);
    assert!(incomplete[0].completed_chunks < 20);

    // resume finishes the remainder (the tripwire only fires at send 3)
    let (_, handle) = h.upload.resume(&file_id, &source).unwrap();
    assert_eq!(handle.join().unwrap().unwrap(), TransferOutcome::Completed);
    assert!(h.catalog.get_upload_state(&file_id).is_err());

    let dest = h.root.join("out/big.bin");
    let (_, handle) = h.download.start(&file_id, &dest, None).unwrap();
    handle.join().unwrap().unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), payload);
}

#[test]
fn cancel_purges_every_record() {
    let h = harness_with(&["tok-a"]);
    let slot = trip_sends(&h, 2, true);

    let payload = patterned(20 * CHUNK as usize, 5);
    let source = write_source(&h.root, "doomed.bin", &payload);

    let (file_id, handle) = h.upload.start(&source, &UploadOptions::default()).unwrap();
    *slot.lock().unwrap() = Some(file_id.clone());
    let err = handle.join().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Canceled);

    // no file, no chunks, no upload state
    assert!(h.catalog.get_file(&file_id).is_err());
    assert!(h.catalog.get_chunks(&file_id).unwrap().is_empty());
    assert!(h.catalog.get_upload_state(&file_id).is_err());
    assert!(h.catalog.list_files().unwrap().is_empty());
}

#[test]
fn transient_send_failures_are_retried() {
    let h = harness();
    h.transport.fail_sends([
        TransportError::Timeout,
        TransportError::Network("reset".into()),
    ]);

    let payload = patterned(2 * CHUNK as usize + 10, 1);
    let source = write_source(&h.root, "flaky.bin", &payload);

    let (_file_id, handle) = h.upload.start(&source, &UploadOptions::default()).unwrap();
    assert_eq!(handle.join().unwrap().unwrap(), TransferOutcome::Completed);
}

#[test]
fn exhausted_retries_fail_the_upload_and_resume_recovers() {
    // a single worker so all three scripted errors land on one chunk
    let h = harness_with(&["tok-a"]);
    let h = Harness {
        upload: Arc::new(UploadEngine::new(
            h.catalog.clone(),
            h.transport.clone() as Arc<dyn Transport>,
            Arc::new(CredentialPool::from_tokens(["tok-a"]).unwrap()),
            h.controls.clone(),
            Arc::new(NullSink),
            TransferSettings {
                max_parallel_chunks: 1,
                ..test_settings()
            },
            "chat-1",
        )),
        ..h
    };
    h.transport.fail_sends([
        TransportError::Timeout,
        TransportError::Timeout,
        TransportError::Timeout,
    ]);

    let payload = patterned(2 * CHUNK as usize, 8);
    let source = write_source(&h.root, "unlucky.bin", &payload);

    let (file_id, handle) = h.upload.start(&source, &UploadOptions::default()).unwrap();
    let err = handle.join().unwrap().unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(
        h.catalog.get_upload_state(&file_id).unwrap().state,
        TransferState::Failed
    );

    // failed chunks go back to pending and the upload completes
    let (_, handle) = h.upload.resume(&file_id, &source).unwrap();
    assert_eq!(handle.join().unwrap().unwrap(), TransferOutcome::Completed);
}

#[test]
fn resume_rejects_changed_source() {
    let h = harness_with(&["tok-a"]);
    let slot = trip_sends(&h, 2, false);

    let payload = patterned(20 * CHUNK as usize, 77);
    let source = write_source(&h.root, "mutating.bin", &payload);

    let (file_id, handle) = h.upload.start(&source, &UploadOptions::default()).unwrap();
    *slot.lock().unwrap() = Some(file_id.clone());
    handle.join().unwrap().unwrap();

    // same length, different content
    let mut altered = payload.clone();
    altered[123] ^= 0xFF;
    std::fs::write(&source, &altered).unwrap();

    let err = h.upload.resume(&file_id, &source).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SourceMismatch);
}

#[test]
fn corrupted_chunk_fails_download_with_integrity_error() {
    let h = harness();
    let payload = patterned(3 * CHUNK as usize, 21);
    let source = write_source(&h.root, "target.bin", &payload);

    let (file_id, handle) = h.upload.start(&source, &UploadOptions::default()).unwrap();
    handle.join().unwrap().unwrap();

    // flip one byte of the middle chunk's stored document
    let chunks = h.catalog.get_chunks(&file_id).unwrap();
    h.transport
        .corrupt_document(chunks[1].transport_id.as_ref().unwrap(), 100);

    let dest = h.root.join("out/target.bin");
    let (_, handle) = h.download.start(&file_id, &dest, None).unwrap();
    let err = handle.join().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IntegrityFailure);
    // never produce a corrupted destination
    assert!(!dest.exists());
}

#[test]
fn download_pauses_and_resumes_using_scratch_chunks() {
    let h = harness_with(&["tok-a"]);
    let slot = trip_fetches(&h, 3, false);

    let payload = patterned(20 * CHUNK as usize, 13);
    let source = write_source(&h.root, "paused-dl.bin", &payload);
    let (file_id, handle) = h.upload.start(&source, &UploadOptions::default()).unwrap();
    handle.join().unwrap().unwrap();

    let dest = h.root.join("out/paused-dl.bin");
    let (download_id, handle) = h.download.start(&file_id, &dest, None).unwrap();
    *slot.lock().unwrap() = Some(download_id.clone());
    let outcome = handle.join().unwrap().unwrap();
    assert_eq!(outcome, TransferOutcome::Paused);

    let incomplete = h.catalog.list_incomplete_downloads().unwrap();
    assert_eq!(incomplete.len(), 1);
    assert!(incomplete[0].completed_chunks >= 3);
    assert!(incomplete[0].completed_chunks < 20);

    let (_, handle) = h.download.resume(&download_id, None).unwrap();
    assert_eq!(handle.join().unwrap().unwrap(), TransferOutcome::Completed);
    assert_eq!(std::fs::read(&dest).unwrap(), payload);
}

#[test]
fn canceled_download_removes_scratch_and_state() {
    let h = harness_with(&["tok-a"]);
    let slot = trip_fetches(&h, 2, true);

    let payload = patterned(20 * CHUNK as usize, 55);
    let source = write_source(&h.root, "dl-doomed.bin", &payload);
    let (file_id, handle) = h.upload.start(&source, &UploadOptions::default()).unwrap();
    handle.join().unwrap().unwrap();

    let dest = h.root.join("out/dl-doomed.bin");
    let (download_id, handle) = h.download.start(&file_id, &dest, None).unwrap();
    *slot.lock().unwrap() = Some(download_id.clone());
    let err = handle.join().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Canceled);

    assert!(!h.root.join("scratch").join(&download_id).exists());
    assert!(h.catalog.get_download_state(&download_id).is_err());
    assert!(!dest.exists());
}

#[test]
fn encrypted_payload_round_trips_through_engines() {
    let h = harness();
    let payload = patterned(2 * CHUNK as usize + 33, 66);
    let plain = write_source(&h.root, "secret.bin", &payload);

    // the orchestrator encrypts before handing the file to the engine
    let sealed = h.root.join("secret.bin.tmp");
    chatvault_crypto::encrypt_file(&plain, &sealed, "abc").unwrap();

    let opts = UploadOptions {
        display_name: Some("secret.bin".into()),
        is_encrypted: true,
    };
    let (file_id, handle) = h.upload.start(&sealed, &opts).unwrap();
    handle.join().unwrap().unwrap();

    let record = h.catalog.get_file(&file_id).unwrap();
    assert!(record.is_encrypted);
    assert_eq!(record.name, "secret.bin");

    let dest = h.root.join("out/secret.bin");
    let (_, handle) = h
        .download
        .start(&file_id, &dest, Some("abc".to_string()))
        .unwrap();
    assert_eq!(handle.join().unwrap().unwrap(), TransferOutcome::Completed);
    assert_eq!(std::fs::read(&dest).unwrap(), payload);
}
