//! Property-based checks of the upload paths over random sizes, chunk
//! thresholds and source chunking.

mod common;

use bytes::Bytes;
use common::*;
use futures::stream;
use proptest::prelude::*;
use std::io;
use swift_objstore::{ErrorKind, Payload, WritePath, payload::read_all};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Split `data` at the given cut points into a stream without a size hint.
fn chunked(data: &[u8], cuts: &[usize]) -> Payload {
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (data.len() + 1)).collect();
    points.push(0);
    points.push(data.len());
    points.sort_unstable();
    points.dedup();
    let chunks: Vec<io::Result<Bytes>> = points
        .windows(2)
        .map(|w| Ok(Bytes::copy_from_slice(&data[w[0]..w[1]])))
        .collect();
    Payload::from_stream(stream::iter(chunks))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_round_trip_any_size(
        len in 0usize..600,
        chunk in 1u64..128,
        known_size in any::<bool>(),
        cuts in prop::collection::vec(any::<usize>(), 0..8),
    ) {
        runtime().block_on(async {
            let (conn, c) = memory_container(chunk).await;
            let data = pattern(len);
            let payload = if known_size {
                Payload::from(data.clone())
            } else {
                chunked(&data, &cuts)
            };
            let report = c.upload("obj", payload).await.unwrap();

            let expect_single = known_size && (len as u64) < chunk;
            prop_assert_eq!(report.path == WritePath::Single, expect_single);
            prop_assert_eq!(report.bytes, len as u64);
            if !expect_single {
                let expected_segments = (len as u64).div_ceil(chunk) as usize;
                prop_assert_eq!(report.segments, expected_segments);
                prop_assert_eq!(conn.object_names_in("data_segments").len(), expected_segments);
            }
            prop_assert_eq!(fetch(&c, "obj").await, data);
            Ok(())
        })?;
    }

    #[test]
    fn prop_ranges_match_slices(
        len in 1usize..300,
        chunk in 1u64..64,
        a in any::<usize>(),
        b in any::<usize>(),
    ) {
        runtime().block_on(async {
            let (_, c) = memory_container(chunk).await;
            let data = pattern(len);
            c.upload("obj", Payload::from(data.clone())).await.unwrap();

            let offset = a % len;
            let length = b % (len - offset + 1);
            let got = read_all(c.get_range("obj", offset as i64, length as i64).await.unwrap())
                .await
                .unwrap();
            prop_assert_eq!(&got[..], &data[offset..offset + length]);

            let tail = read_all(c.get_range("obj", offset as i64, -1).await.unwrap())
                .await
                .unwrap();
            prop_assert_eq!(&tail[..], &data[offset..]);
            Ok(())
        })?;
    }

    #[test]
    fn prop_failed_upload_leaves_no_segments(
        len in 2usize..400,
        chunk in 1u64..64,
        fail_after in 0usize..6,
    ) {
        runtime().block_on(async {
            let (conn, c) = memory_container(chunk).await;
            c.upload("obj", Payload::from("previous")).await.unwrap();

            conn.fail_puts_after(fail_after);
            let result = c.upload("obj", Payload::from(pattern(len))).await;
            conn.clear_faults();

            match result {
                Ok(_) => prop_assert_eq!(fetch(&c, "obj").await, pattern(len)),
                Err(err) => {
                    prop_assert_eq!(err.kind(), ErrorKind::Backend);
                    prop_assert_eq!(fetch(&c, "obj").await, b"previous".to_vec());
                    prop_assert!(conn.object_names_in("data_segments").is_empty());
                }
            }
            Ok(())
        })?;
    }
}
