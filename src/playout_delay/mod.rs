mod controller;
mod extension;
#[cfg(test)]
mod playout_delay_test;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rtcp::receiver_report::ReceiverReport;
use util::sync::Mutex;

pub use controller::{PlayoutDelayController, PlayoutDelayState, PLAYOUT_DELAY_DEFAULT_MAX};
pub use extension::{
    PlayoutDelayExtension, PLAYOUT_DELAY_EXTENSION_SIZE, PLAYOUT_DELAY_MAX_VALUE,
};

use crate::error::Result;
use crate::stream_info::StreamInfo;
use crate::{
    Attributes, Interceptor, InterceptorBuilder, RTCPReader, RTCPWriter, RTPReader, RTPWriter,
};

pub const PLAYOUT_DELAY_URI: &str = "http://www.webrtc.org/experiments/rtp-hdrext/playout-delay";

/// make_playout_delay_interceptor returns the concrete interceptor so callers
/// keep a handle for the per-stream jitter intake.
pub fn make_playout_delay_interceptor(min_delay: u32, max_delay: u32) -> Arc<PlayoutDelay> {
    PlayoutDelayBuilder::default()
        .with_min_delay(min_delay)
        .with_max_delay(max_delay)
        .build_playout_delay()
}

/// PlayoutDelayBuilder can be used to configure a PlayoutDelay Interceptor.
#[derive(Default)]
pub struct PlayoutDelayBuilder {
    min_delay: Option<u32>,
    max_delay: Option<u32>,
}

impl PlayoutDelayBuilder {
    /// with_min_delay sets the lower delay bound in milliseconds.
    pub fn with_min_delay(mut self, min_delay: u32) -> PlayoutDelayBuilder {
        self.min_delay = Some(min_delay);
        self
    }

    /// with_max_delay sets the upper delay bound in milliseconds. Zero or
    /// out-of-range values fall back to the largest signalable delay.
    pub fn with_max_delay(mut self, max_delay: u32) -> PlayoutDelayBuilder {
        self.max_delay = Some(max_delay);
        self
    }

    /// build_playout_delay returns the concrete interceptor so callers keep a
    /// handle for the per-stream jitter intake.
    pub fn build_playout_delay(&self) -> Arc<PlayoutDelay> {
        Arc::new(PlayoutDelay::new(
            self.min_delay.unwrap_or(0),
            self.max_delay.unwrap_or(0),
        ))
    }
}

impl InterceptorBuilder for PlayoutDelayBuilder {
    fn build(&self, _id: &str) -> Result<Arc<dyn Interceptor + Send + Sync>> {
        Ok(self.build_playout_delay())
    }
}

/// PlayoutDelay signals a target playout delay on every outgoing stream that
/// negotiated the playout-delay extension. The delay follows the jitter
/// reported through [`PlayoutDelay::set_jitter`], and the encoded value rides
/// on each packet until a receiver report acknowledges a sequence number sent
/// with it.
pub struct PlayoutDelay {
    min_delay: u32,
    max_delay: u32,

    send_streams: Arc<Mutex<HashMap<u32, Arc<PlayoutDelayController>>>>,
}

impl PlayoutDelay {
    pub fn new(min_delay: u32, max_delay: u32) -> Self {
        PlayoutDelay {
            min_delay,
            max_delay,
            send_streams: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// set_jitter feeds a jitter measurement in milliseconds for one outgoing
    /// stream, typically from the jitter estimator of the matching receive
    /// path.
    pub fn set_jitter(&self, ssrc: u32, jitter: u32) {
        let controller = { self.send_streams.lock().get(&ssrc).cloned() };
        if let Some(controller) = controller {
            controller.set_jitter(jitter);
        }
    }

    /// controller returns the delay controller bound for ssrc, if any.
    pub fn controller(&self, ssrc: u32) -> Option<Arc<PlayoutDelayController>> {
        self.send_streams.lock().get(&ssrc).cloned()
    }
}

#[async_trait]
impl Interceptor for PlayoutDelay {
    /// bind_rtcp_reader returns a reader that feeds acknowledged sequence
    /// numbers from receiver reports back into the delay controllers.
    async fn bind_rtcp_reader(
        &self,
        reader: Arc<dyn RTCPReader + Send + Sync>,
    ) -> Arc<dyn RTCPReader + Send + Sync> {
        Arc::new(DelayRtcpReader {
            parent_rtcp_reader: reader,
            send_streams: Arc::clone(&self.send_streams),
        })
    }

    /// bind_rtcp_writer lets you modify any outgoing RTCP packets. It is called once per PeerConnection. The returned method
    /// will be called once per packet batch.
    async fn bind_rtcp_writer(
        &self,
        writer: Arc<dyn RTCPWriter + Send + Sync>,
    ) -> Arc<dyn RTCPWriter + Send + Sync> {
        writer
    }

    /// bind_local_stream returns a writer that attaches the encoded delay to
    /// outgoing packets while the current value is unacknowledged.
    async fn bind_local_stream(
        &self,
        info: &StreamInfo,
        writer: Arc<dyn RTPWriter + Send + Sync>,
    ) -> Arc<dyn RTPWriter + Send + Sync> {
        let hdr_ext_id = info.header_extension_id(PLAYOUT_DELAY_URI);
        if hdr_ext_id == 0 {
            // Don't add header extension if ID is 0, because 0 is an invalid extension ID
            return writer;
        }

        let controller = match PlayoutDelayController::new(self.min_delay, self.max_delay) {
            Ok(controller) => Arc::new(controller),
            Err(err) => {
                log::error!(
                    "failed to create playout delay controller for stream {}: {err}",
                    info.ssrc
                );
                return writer;
            }
        };

        {
            let mut send_streams = self.send_streams.lock();
            send_streams.insert(info.ssrc, Arc::clone(&controller));
        }

        Arc::new(DelayStream {
            next_rtp_writer: writer,
            controller,
            hdr_ext_id,
        })
    }

    /// unbind_local_stream is called when the Stream is removed. It can be used to clean up any data related to that track.
    async fn unbind_local_stream(&self, info: &StreamInfo) {
        let mut send_streams = self.send_streams.lock();
        send_streams.remove(&info.ssrc);
    }

    /// bind_remote_stream lets you modify any incoming RTP packets. It is called once for per RemoteStream. The returned method
    /// will be called once per rtp packet.
    async fn bind_remote_stream(
        &self,
        _info: &StreamInfo,
        reader: Arc<dyn RTPReader + Send + Sync>,
    ) -> Arc<dyn RTPReader + Send + Sync> {
        reader
    }

    /// unbind_remote_stream is called when the Stream is removed. It can be used to clean up any data related to that track.
    async fn unbind_remote_stream(&self, _info: &StreamInfo) {}

    /// close closes the Interceptor, cleaning up any data if necessary.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct DelayStream {
    next_rtp_writer: Arc<dyn RTPWriter + Send + Sync>,
    controller: Arc<PlayoutDelayController>,
    hdr_ext_id: u8,
}

/// RTPWriter is used by Interceptor.bind_local_stream.
#[async_trait]
impl RTPWriter for DelayStream {
    /// write a rtp packet
    async fn write(&self, pkt: &rtp::packet::Packet, a: &Attributes) -> Result<usize> {
        match self.controller.next_extension(pkt.header.sequence_number) {
            Some(payload) => {
                let mut pkt = pkt.clone();
                pkt.header.set_extension(self.hdr_ext_id, payload)?;
                self.next_rtp_writer.write(&pkt, a).await
            }
            None => self.next_rtp_writer.write(pkt, a).await,
        }
    }
}

struct DelayRtcpReader {
    parent_rtcp_reader: Arc<dyn RTCPReader + Send + Sync>,
    send_streams: Arc<Mutex<HashMap<u32, Arc<PlayoutDelayController>>>>,
}

#[async_trait]
impl RTCPReader for DelayRtcpReader {
    /// read a batch of rtcp packets, acknowledging delay values from the
    /// highest received sequence number of each receiver report block. The
    /// batch itself passes through untouched.
    async fn read(&self, buf: &mut [u8], a: &Attributes) -> Result<(usize, Attributes)> {
        let (n, attr) = self.parent_rtcp_reader.read(buf, a).await?;

        let mut b = &buf[..n];
        if let Ok(pkts) = rtcp::packet::unmarshal(&mut b) {
            for p in &pkts {
                if let Some(rr) = p.as_any().downcast_ref::<ReceiverReport>() {
                    for report in &rr.reports {
                        let controller = { self.send_streams.lock().get(&report.ssrc).cloned() };
                        if let Some(controller) = controller {
                            controller.on_seq_acked(report.last_sequence_number as u16);
                        }
                    }
                }
            }
        }

        Ok((n, attr))
    }
}
