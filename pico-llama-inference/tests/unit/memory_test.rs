use super::*;
use std::io::Write;
use tempfile::NamedTempFile;

fn float_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

#[test]
fn test_capacity_rounds_up_to_words() {
    let memory = ExternalMemory::new(10);

    assert_eq!(memory.capacity(), 12);
    assert_eq!(memory.loaded_len(), 0);
    assert!(memory.bytes().is_empty());
    assert!(memory.floats().is_empty());
}

#[test]
fn test_load_exposes_bytes_and_floats() {
    let blob = float_bytes(&[1.0, -2.5, 3.25]);
    let mut memory = ExternalMemory::new(64);

    let loaded = memory.load(&blob).unwrap();

    assert_eq!(loaded, 12);
    assert_eq!(memory.loaded_len(), 12);
    assert_eq!(memory.bytes(), &blob[..]);
    assert_eq!(memory.floats(), &[1.0, -2.5, 3.25]);
}

#[test]
fn test_floats_drop_partial_trailing_word() {
    let mut blob = float_bytes(&[0.5, 4.0]);
    blob.extend_from_slice(&[1, 2]);
    let mut memory = ExternalMemory::new(blob.len());

    memory.load(&blob).unwrap();

    assert_eq!(memory.bytes().len(), 10);
    assert_eq!(memory.floats(), &[0.5, 4.0]);
}

#[test]
fn test_reload_replaces_previous_contents() {
    let mut memory = ExternalMemory::new(16);
    memory.load(&float_bytes(&[1.0, 2.0, 3.0])).unwrap();

    memory.load(&float_bytes(&[9.0])).unwrap();

    assert_eq!(memory.floats(), &[9.0]);
}

#[test]
fn test_load_rejects_blob_larger_than_region() {
    let mut memory = ExternalMemory::new(8);

    let err = memory.load(&[0u8; 9]).unwrap_err();

    assert!(matches!(err, InferenceError::RegionTooSmall { needed: 9, capacity: 8 }));
    assert_eq!(memory.loaded_len(), 0);
}

#[test]
fn test_mapped_blob_reads_file() -> std::io::Result<()> {
    let mut file = NamedTempFile::new()?;
    file.write_all(b"pico-llama")?;
    file.flush()?;

    let blob = MappedBlob::open(file.path()).unwrap();

    assert_eq!(blob.as_bytes(), b"pico-llama");
    Ok(())
}

#[test]
fn test_mapped_blob_missing_file() {
    let err = MappedBlob::open("/nonexistent/pico-llama/model.bin").unwrap_err();

    assert!(matches!(err, InferenceError::Io(_)));
}

#[test]
fn test_blob_cursor_reads_little_endian() {
    let mut data = 7i32.to_le_bytes().to_vec();
    data.extend_from_slice(&1.5f32.to_le_bytes());
    data.extend_from_slice(b"xyz");
    let mut cursor = BlobCursor::new(&data);

    assert_eq!(cursor.read_i32(|| "count".to_string()).unwrap(), 7);
    assert_eq!(cursor.read_f32(|| "score".to_string()).unwrap(), 1.5);
    assert_eq!(cursor.remaining(), 3);
    assert_eq!(cursor.get_bytes(3, || "text".to_string()).unwrap(), b"xyz");
    assert_eq!(cursor.remaining(), 0);
}

#[test]
fn test_blob_cursor_truncation_keeps_position() {
    let data = [1u8, 2];
    let mut cursor = BlobCursor::new(&data);

    let err = cursor.read_i32(|| "field".to_string()).unwrap_err();

    assert!(matches!(err, InferenceError::Truncated { needed: 4, available: 2, .. }));
    assert_eq!(cursor.remaining(), 2);
}
