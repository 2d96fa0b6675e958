//! Pipe factory (spec component C5).

use std::sync::Arc;

use nix::unistd::pipe as nix_pipe;

use crate::codec::{Decoder, DefaultCodec, Encoder, Payload, RawCodec};
use crate::endpoint::{DuplexEndpoint, ReadEndpoint, WriteEndpoint};

fn raw_os_pipe() -> std::io::Result<(i32, i32)> {
    let (r, w) = nix_pipe().map_err(std::io::Error::from)?;
    use std::os::fd::IntoRawFd;
    Ok((r.into_raw_fd(), w.into_raw_fd()))
}

/// Creates one OS pipe and wraps its two ends using the default
/// (`bincode`-over-`serde`) codec.
pub fn pipe<T: Payload>() -> std::io::Result<(ReadEndpoint<T>, WriteEndpoint<T>)> {
    pipe_with(Arc::new(DefaultCodec), Arc::new(DefaultCodec))
}

/// Creates one OS pipe whose payloads are raw byte sequences, with no
/// encoding step: values must already be `Vec<u8>`.
pub fn pipe_raw() -> std::io::Result<(ReadEndpoint<Vec<u8>>, WriteEndpoint<Vec<u8>>)> {
    pipe_with(Arc::new(RawCodec), Arc::new(RawCodec))
}

/// Creates one OS pipe using a caller-supplied encoder/decoder pair.
pub fn pipe_with<T: Send + 'static>(
    decoder: Arc<dyn Decoder<T>>,
    encoder: Arc<dyn Encoder<T>>,
) -> std::io::Result<(ReadEndpoint<T>, WriteEndpoint<T>)> {
    let (read_fd, write_fd) = raw_os_pipe()?;
    let reader = ReadEndpoint::new(read_fd, decoder)?;
    let writer = WriteEndpoint::new(write_fd, encoder)?;
    Ok((reader, writer))
}

/// Creates a duplex channel: two OS pipes (forward and reverse), returned
/// as two symmetric duplex endpoints. Endpoint A exposes (pipe 1 reader,
/// pipe 2 writer); endpoint B exposes (pipe 2 reader, pipe 1 writer).
pub fn duplex_pipe<T: Payload>() -> std::io::Result<(DuplexEndpoint<T>, DuplexEndpoint<T>)> {
    duplex_pipe_with(
        Arc::new(DefaultCodec),
        Arc::new(DefaultCodec),
        Arc::new(DefaultCodec),
        Arc::new(DefaultCodec),
    )
}

/// Caller-supplied-codec variant of [`duplex_pipe`].
pub fn duplex_pipe_with<T: Send + 'static>(
    decoder_1: Arc<dyn Decoder<T>>,
    encoder_1: Arc<dyn Encoder<T>>,
    decoder_2: Arc<dyn Decoder<T>>,
    encoder_2: Arc<dyn Encoder<T>>,
) -> std::io::Result<(DuplexEndpoint<T>, DuplexEndpoint<T>)> {
    let (reader_1, writer_1) = pipe_with(decoder_1, encoder_1)?;
    let (reader_2, writer_2) = pipe_with(decoder_2, encoder_2)?;
    let endpoint_a = DuplexEndpoint::new(reader_1, writer_2);
    let endpoint_b = DuplexEndpoint::new(reader_2, writer_1);
    Ok((endpoint_a, endpoint_b))
}
