use crate::clock_transform::LinearTransform;
use crate::receiver::codec_params::CodecParams;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

/// The decode / render pipeline for a single flow. The receiver owns each decoder exclusively
///  and calls it from its worker task only.
#[cfg_attr(test, automock)]
pub trait AudioDecoder: Send + 'static {
    /// `discontinuity` is set for the first access unit after packets were lost or skipped
    fn queue_access_unit(&mut self, access_unit: Bytes, pts: Option<i64>, discontinuity: bool);

    /// discard everything that was queued but not rendered yet
    fn flush(&mut self);

    fn set_volume(&mut self, volume: u8);

    /// mapping from the stream's media time (PTS) to common time
    fn set_media_to_common_transform(&mut self, transform: LinearTransform);

    fn end_of_stream(&mut self);

    /// true if the decoder will run out of data soon, so waiting longer for a retransmission
    ///  would cause an audible dropout
    fn is_about_to_underflow(&self) -> bool;

    /// A decoder that failed stays failed. This is polled by the receiver, which shuts down
    ///  when a fatal error is reported.
    fn fatal_error(&self) -> Option<String>;
}

#[cfg_attr(test, automock)]
pub trait DecoderFactory: Send + Sync + 'static {
    fn create_decoder(&self, program_id: u8, substream_id: u8, params: &CodecParams) -> anyhow::Result<Box<dyn AudioDecoder>>;
}
