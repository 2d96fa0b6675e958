//! End-to-end pipe behavior that doesn't require spawning a child process.

use std::time::Duration;

use taskpipe::{duplex_pipe, pipe, pipe_raw, Error, GetError};

#[tokio::test]
async fn simple_bytes_round_trip() {
    let (reader, writer) = pipe::<String>().unwrap();
    writer.put(&"hello".to_string()).await.unwrap();
    let got = reader.get(None).await.unwrap();
    assert_eq!(got, "hello");
}

#[tokio::test]
async fn many_small_messages_preserve_order() {
    let (reader, writer) = pipe::<u32>().unwrap();
    for i in 0..500u32 {
        writer.put(&i).await.unwrap();
    }
    for i in 0..500u32 {
        assert_eq!(reader.get(None).await.unwrap(), i);
    }
}

#[tokio::test]
async fn large_payload_round_trips_over_duplex() {
    let (a, b) = duplex_pipe::<Vec<u8>>().unwrap();
    let payload: Vec<u8> = (0..64 * 1024usize).map(|i| (i % 251) as u8).collect();
    let checksum: u64 = payload.iter().map(|b| *b as u64).sum();

    let sender = tokio::spawn({
        let payload = payload.clone();
        async move { a.put(&payload).await.unwrap() }
    });

    let received = b.get(None).await.unwrap();
    sender.await.unwrap();

    assert_eq!(received.len(), payload.len());
    let got_checksum: u64 = received.iter().map(|b| *b as u64).sum();
    assert_eq!(got_checksum, checksum);
}

#[tokio::test]
async fn multiple_readers_fan_in_from_two_pipes() {
    let (reader_a, writer_a) = pipe::<u32>().unwrap();
    let (reader_b, writer_b) = pipe::<u32>().unwrap();

    let writers = tokio::spawn(async move {
        for i in 0..100u32 {
            writer_a.put(&i).await.unwrap();
        }
        for i in 100..200u32 {
            writer_b.put(&i).await.unwrap();
        }
    });

    let mut total = 0u64;
    for _ in 0..100 {
        total += reader_a.get(None).await.unwrap() as u64;
    }
    for _ in 0..100 {
        total += reader_b.get(None).await.unwrap() as u64;
    }
    writers.await.unwrap();

    let expected: u64 = (0..200u32).map(|n| n as u64).sum();
    assert_eq!(total, expected);
}

#[tokio::test]
async fn closed_writer_surfaces_as_eof_not_io_error() {
    let (reader, writer) = pipe_raw().unwrap();
    writer.close().unwrap();
    let err = reader.get(None).await.unwrap_err();
    assert!(matches!(err, GetError::Endpoint(Error::Eof)));
}

#[tokio::test]
async fn get_times_out_without_poisoning_the_endpoint() {
    let (reader, writer) = pipe::<u8>().unwrap();
    let err = reader.get(Some(Duration::from_millis(20))).await.unwrap_err();
    assert!(matches!(err, GetError::Timeout));

    writer.put(&7u8).await.unwrap();
    assert_eq!(reader.get(None).await.unwrap(), 7);
}

#[tokio::test]
async fn double_close_is_reported_as_already_closed() {
    let (reader, writer) = pipe_raw().unwrap();
    writer.close().unwrap();
    assert!(matches!(writer.close().unwrap_err(), Error::AlreadyClosed));
    reader.close().unwrap();
}
