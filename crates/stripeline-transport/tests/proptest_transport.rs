//! Property-based tests for stripeline-transport using proptest.
//!
//! These cover the wire codec contract (every tag decodes to the value that
//! was encoded, oversized `b` values never desynchronise the stream) and the
//! FIFO and end-of-stream guarantees of the IoBuffer.

use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use stripeline_transport::iobuffer::IoBuffer;
use stripeline_transport::wire::{Blob, FixedBuf};
use stripeline_transport::{Connection, RecvMode};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn pair() -> (Connection, Connection) {
    let (a, b) = tokio::io::duplex(1 << 20);
    (Connection::from_stream(a, "tx"), Connection::from_stream(b, "rx"))
}

/// Generator for a read mode.
fn any_mode() -> impl Strategy<Value = RecvMode> {
    prop_oneof![Just(RecvMode::Buffered), Just(RecvMode::Just)]
}

/// Generator for interleaved buffer operations: `(is_enqueue, chunk size)`.
fn any_ops() -> impl Strategy<Value = Vec<(bool, usize)>> {
    proptest::collection::vec((any::<bool>(), 1usize..40), 1..200)
}

proptest! {
    #[test]
    fn prop_scalars_survive_the_wire(
        c in any::<i8>(),
        h in any::<i16>(),
        i in any::<i32>(),
        o in any::<i64>(),
        mode in any_mode(),
    ) {
        let got = runtime().block_on(async {
            let (mut tx, mut rx) = pair();
            tx.send(&(c, h, i, o)).await.unwrap();
            tx.flush().await.unwrap();
            rx.recv_value::<(i8, i16, i32, i64)>(mode).await.unwrap()
        });
        prop_assert_eq!(got, (c, h, i, o));
    }

    #[test]
    fn prop_negative_offsets_are_bit_exact(o in i64::MIN..0i64) {
        let got = runtime().block_on(async {
            let (mut tx, mut rx) = pair();
            tx.send(&o).await.unwrap();
            tx.flush().await.unwrap();
            rx.recv_value::<i64>(RecvMode::Just).await.unwrap()
        });
        prop_assert_eq!(got.to_be_bytes(), o.to_be_bytes());
    }

    #[test]
    fn prop_strings_and_buffers_survive_the_wire(
        s in ".{0,300}",
        b in proptest::collection::vec(any::<u8>(), 0..256),
        mode in any_mode(),
    ) {
        let (got_s, got_b) = runtime().block_on(async {
            let (mut tx, mut rx) = pair();
            tx.send(&(s.as_str(), Blob(&b))).await.unwrap();
            tx.flush().await.unwrap();
            rx.recv_value::<(String, FixedBuf<256>)>(mode).await.unwrap()
        });
        prop_assert_eq!(got_s, s);
        prop_assert_eq!(got_b.actual, b.len());
        prop_assert_eq!(got_b.data, b);
    }

    #[test]
    fn prop_oversized_buffer_is_truncated_honestly(
        data in proptest::collection::vec(any::<u8>(), 1..2048),
        cap_fraction in 0.0f64..1.0,
        trailer in any::<i32>(),
        mode in any_mode(),
    ) {
        let cap = ((data.len() as f64) * cap_fraction) as usize;
        prop_assume!(cap < data.len());
        let (actual, copied, next) = runtime().block_on(async {
            let (mut tx, mut rx) = pair();
            tx.send(&(Blob(&data), trailer)).await.unwrap();
            tx.flush().await.unwrap();
            let mut dst = vec![0xAAu8; cap];
            let actual = rx.recv_fixed(mode, &mut dst).await.unwrap().unwrap();
            let next: i32 = rx.recv_value(mode).await.unwrap();
            (actual, dst, next)
        });
        prop_assert_eq!(actual, data.len());
        prop_assert_eq!(&copied[..], &data[..cap]);
        prop_assert_eq!(next, trailer);
    }

    #[test]
    fn prop_iobuffer_is_fifo(
        input in proptest::collection::vec(any::<u8>(), 0..2000),
        ops in any_ops(),
        capacity in 1usize..64,
    ) {
        let output = runtime().block_on(async {
            let mut buf = IoBuffer::new(capacity);
            let mut source: &[u8] = &input;
            let mut output = Vec::new();
            let mut enqueued = 0usize;
            for (is_enqueue, chunk) in &ops {
                if *is_enqueue {
                    enqueued += buf.enqueue(&mut source, *chunk).await;
                } else {
                    buf.dequeue(&mut output, *chunk).await;
                }
                assert_eq!(&output[..], &input[..output.len()]);
                assert_eq!(output.len() + buf.len(), enqueued);
            }
            while !buf.is_eof() {
                buf.enqueue(&mut source, usize::MAX).await;
                buf.dequeue(&mut output, usize::MAX).await;
            }
            output
        });
        prop_assert_eq!(output, input);
    }

    #[test]
    fn prop_write_close_fires_once(
        input in proptest::collection::vec(any::<u8>(), 0..500),
        extra_calls in 1usize..10,
    ) {
        let fired = runtime().block_on(async {
            let closes = Arc::new(AtomicUsize::new(0));
            let counter = closes.clone();
            let mut buf = IoBuffer::new(32);
            buf.set_write_close(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            let mut source: &[u8] = &input;
            let mut sink = Vec::new();
            while !buf.is_write_eof() {
                buf.enqueue(&mut source, usize::MAX).await;
                buf.dequeue(&mut sink, usize::MAX).await;
            }
            for _ in 0..extra_calls {
                buf.enqueue(&mut source, usize::MAX).await;
                buf.dequeue(&mut sink, usize::MAX).await;
                buf.purge(1);
                buf.get(&mut [0u8; 4]);
            }
            assert_eq!(sink, input);
            closes.load(Ordering::SeqCst)
        });
        prop_assert_eq!(fired, 1);
    }
}
