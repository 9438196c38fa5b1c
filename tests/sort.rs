use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use brasa::elem::{self, decode_slice};
use brasa::{sort_vecs, EngineConfig, Runtime};

fn runtime() -> Arc<Runtime> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Runtime::new(EngineConfig::compact()).unwrap()
}

fn fill_from_slice_i32(rt: &Arc<Runtime>, values: &[i32]) -> brasa::EmVec {
    let vec = rt.create_vec(values.len() as u64, elem::int32()).unwrap();
    let owned: Vec<i32> = values.to_vec();
    vec.set_data(move |idx, out| out.copy_from_slice(&owned[idx as usize].to_le_bytes()))
        .unwrap();
    vec
}

fn fill_from_slice_u64(rt: &Arc<Runtime>, values: &[u64]) -> brasa::EmVec {
    let vec = rt.create_vec(values.len() as u64, elem::uint64()).unwrap();
    let owned: Vec<u64> = values.to_vec();
    vec.set_data(move |idx, out| out.copy_from_slice(&owned[idx as usize].to_le_bytes()))
        .unwrap();
    vec
}

#[test]
fn reverse_fill_sorts_ascending() -> brasa::Result<()> {
    let rt = runtime();
    let vec = rt.create_vec(8, elem::int32())?;
    vec.set_data(|idx, out| out.copy_from_slice(&(7 - idx as i32).to_le_bytes()))?;
    vec.sort()?;
    assert_eq!(
        decode_slice::<i32>(&vec.read_all()?),
        vec![0, 1, 2, 3, 4, 5, 6, 7]
    );
    assert!(vec.is_sorted()?);
    Ok(())
}

#[test]
fn merge_boundary_short_final_chunk() -> brasa::Result<()> {
    // compact config: 512-byte sort buffer = 128 i32 elements per chunk.
    // Three full chunks plus a 7-element tail must sort and merge.
    let rt = runtime();
    let len = 3 * 128 + 7;
    let vec = rt.create_vec(len as u64, elem::int32())?;
    vec.set_data(move |idx, out| {
        out.copy_from_slice(&((len as i32) - 1 - idx as i32).to_le_bytes())
    })?;
    vec.sort()?;
    let values = decode_slice::<i32>(&vec.read_all()?);
    assert_eq!(values.len(), len);
    assert!(values.iter().enumerate().all(|(i, &v)| v == i as i32));
    assert!(vec.is_sorted()?);
    Ok(())
}

#[test]
fn random_sort_preserves_multiset() -> brasa::Result<()> {
    let rt = runtime();
    let mut rng = ChaCha8Rng::seed_from_u64(0xB0BA);
    let input: Vec<u64> = (0..450).map(|_| rng.gen()).collect();
    let vec = fill_from_slice_u64(&rt, &input);
    assert!(!vec.is_sorted()?);
    vec.sort()?;
    let sorted = decode_slice::<u64>(&vec.read_all()?);
    let mut expected = input.clone();
    expected.sort_unstable();
    assert_eq!(sorted, expected);
    Ok(())
}

#[test]
fn sort_with_moderate_duplicates() -> brasa::Result<()> {
    let rt = runtime();
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let input: Vec<u64> = (0..120).map(|_| rng.gen_range(0..30)).collect();
    let vec = fill_from_slice_u64(&rt, &input);
    vec.sort()?;
    let sorted = decode_slice::<u64>(&vec.read_all()?);
    let mut expected = input.clone();
    expected.sort_unstable();
    assert_eq!(sorted, expected);
    Ok(())
}

#[test]
fn sort_rejects_vectors_beyond_one_merge_level() -> brasa::Result<()> {
    // compact config: 8 anchors per chunk, so at most 8 chunks merge in
    // one level. 2000 i32 elements need 16 chunks.
    let rt = runtime();
    let vec = rt.create_vec(2000, elem::int32())?;
    vec.set_data(|idx, out| out.copy_from_slice(&(idx as i32).to_le_bytes()))?;
    assert!(matches!(vec.sort(), Err(brasa::BrasaError::Config(_))));
    Ok(())
}

#[test]
fn sort_is_idempotent() -> brasa::Result<()> {
    let rt = runtime();
    let mut rng = ChaCha8Rng::seed_from_u64(99);
    let input: Vec<i32> = (0..300).map(|_| rng.gen()).collect();
    let vec = fill_from_slice_i32(&rt, &input);
    vec.sort()?;
    let once = decode_slice::<i32>(&vec.read_all()?);
    vec.sort()?;
    let twice = decode_slice::<i32>(&vec.read_all()?);
    assert_eq!(once, twice);
    assert!(vec.is_sorted()?);
    Ok(())
}

#[test]
fn cosort_three_vector_scenario() -> brasa::Result<()> {
    let rt = runtime();
    let keys = fill_from_slice_i32(&rt, &[3, 1, 2]);
    let v1 = fill_from_slice_i32(&rt, &[30, 10, 20]);
    let v2 = fill_from_slice_i32(&rt, &[300, 100, 200]);
    let sorted = sort_vecs(&[keys, v1, v2])?;
    assert_eq!(decode_slice::<i32>(&sorted[0].read_all()?), vec![1, 2, 3]);
    assert_eq!(decode_slice::<i32>(&sorted[1].read_all()?), vec![10, 20, 30]);
    assert_eq!(
        decode_slice::<i32>(&sorted[2].read_all()?),
        vec![100, 200, 300]
    );
    Ok(())
}

#[test]
fn cosort_random_keeps_tuples_together() -> brasa::Result<()> {
    let rt = runtime();
    let mut rng = ChaCha8Rng::seed_from_u64(0x5EED);
    let len = 400usize;
    let keys: Vec<u64> = (0..len).map(|_| rng.gen_range(0..100_000)).collect();
    let payload: Vec<u64> = keys.iter().map(|&k| k * 7 + 1).collect();

    let key_vec = fill_from_slice_u64(&rt, &keys);
    let payload_vec = fill_from_slice_u64(&rt, &payload);
    let sorted = sort_vecs(&[key_vec, payload_vec])?;

    let sorted_keys = decode_slice::<u64>(&sorted[0].read_all()?);
    let sorted_payload = decode_slice::<u64>(&sorted[1].read_all()?);
    assert!(sorted[0].is_sorted()?);

    // the key/payload relationship survives the co-sort
    assert!(sorted_keys
        .iter()
        .zip(&sorted_payload)
        .all(|(&k, &p)| p == k * 7 + 1));

    // and the key multiset is unchanged
    let mut expected = keys.clone();
    expected.sort_unstable();
    assert_eq!(sorted_keys, expected);
    Ok(())
}

#[test]
fn cosort_mixed_element_types() -> brasa::Result<()> {
    let rt = runtime();
    let keys = fill_from_slice_i32(&rt, &[5, -2, 9, 0]);
    let weights = rt.create_vec(4, elem::float64())?;
    let w = [0.5f64, -0.2, 0.9, 0.0];
    weights.set_data(move |idx, out| out.copy_from_slice(&w[idx as usize].to_le_bytes()))?;
    let sorted = sort_vecs(&[keys, weights])?;
    assert_eq!(decode_slice::<i32>(&sorted[0].read_all()?), vec![-2, 0, 5, 9]);
    assert_eq!(
        decode_slice::<f64>(&sorted[1].read_all()?),
        vec![-0.2, 0.0, 0.5, 0.9]
    );
    Ok(())
}

#[test]
fn empty_and_single_element_vectors() -> brasa::Result<()> {
    let rt = runtime();
    let empty = rt.create_vec(0, elem::int32())?;
    empty.sort()?;
    assert!(empty.is_sorted()?);

    let single = fill_from_slice_i32(&rt, &[42]);
    single.sort()?;
    assert_eq!(decode_slice::<i32>(&single.read_all()?), vec![42]);
    Ok(())
}

#[test]
fn io_stats_accumulate() -> brasa::Result<()> {
    let rt = runtime();
    let vec = rt.create_vec(256, elem::int32())?;
    vec.set_data(|idx, out| out.copy_from_slice(&(idx as i32).to_le_bytes()))?;
    let after_fill = rt.io_stats();
    assert!(after_fill.writes > 0);
    assert_eq!(after_fill.bytes_written, 256 * 4);

    vec.sort()?;
    let after_sort = rt.io_stats();
    assert!(after_sort.reads > after_fill.reads);
    assert!(after_sort.bytes_written > after_fill.bytes_written);
    Ok(())
}
