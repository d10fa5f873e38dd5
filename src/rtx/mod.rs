mod finder_stream;

use std::sync::Arc;

use async_trait::async_trait;
use finder_stream::FinderStream;
use util::sync::Mutex;

use crate::error::Result;
use crate::stream_info::StreamInfo;
use crate::{Interceptor, InterceptorBuilder, RTCPReader, RTCPWriter, RTPReader, RTPWriter};

pub const SDES_MID_URI: &str = "urn:ietf:params:rtp-hdrext:sdes:mid";
pub const SDES_RTP_STREAM_ID_URI: &str = "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id";
pub const SDES_REPAIRED_RTP_STREAM_ID_URI: &str =
    "urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id";

const DEFAULT_MAX_PENDING: usize = 32;

/// OnRtxPairFoundHdlrFn is invoked with (repair ssrc, base ssrc) once a repair
/// stream has been matched to the stream it retransmits.
pub type OnRtxPairFoundHdlrFn = Arc<dyn Fn(u32, u32) + Send + Sync>;

/// StreamIdentity is one stream's identity as advertised through its header
/// extensions. A non-empty rid marks a base stream, a non-empty rsid marks a
/// repair stream.
#[derive(Debug, Clone)]
pub struct StreamIdentity {
    pub ssrc: u32,
    pub mid: String,
    pub rid: String,
    pub rsid: String,
}

/// RtxPairFinderBuilder can be used to configure a RtxPairFinder Interceptor.
#[derive(Default)]
pub struct RtxPairFinderBuilder {
    on_pair_found: Option<OnRtxPairFoundHdlrFn>,
    max_pending: Option<usize>,
}

impl RtxPairFinderBuilder {
    /// with_on_pair_found sets the handler called once per matched pair.
    pub fn with_on_pair_found(mut self, handler: OnRtxPairFoundHdlrFn) -> RtxPairFinderBuilder {
        self.on_pair_found = Some(handler);
        self
    }

    /// with_max_pending bounds the number of unmatched stream identities kept
    /// around. When the bound is hit the oldest unmatched entry is dropped.
    pub fn with_max_pending(mut self, max_pending: usize) -> RtxPairFinderBuilder {
        self.max_pending = Some(max_pending);
        self
    }
}

impl InterceptorBuilder for RtxPairFinderBuilder {
    fn build(&self, _id: &str) -> Result<Arc<dyn Interceptor + Send + Sync>> {
        Ok(Arc::new(RtxPairFinder {
            internal: Arc::new(FinderInternal {
                on_pair_found: self.on_pair_found.clone(),
                max_pending: self.max_pending.unwrap_or(DEFAULT_MAX_PENDING).max(1),
                pending: Mutex::new(vec![]),
            }),
        }))
    }
}

pub(crate) struct FinderInternal {
    on_pair_found: Option<OnRtxPairFoundHdlrFn>,
    max_pending: usize,
    pending: Mutex<Vec<StreamIdentity>>,
}

impl FinderInternal {
    /// record takes one observed identity and either matches it against a
    /// complementary pending entry or parks it until its counterpart shows up.
    pub(crate) fn record(&self, identity: StreamIdentity) {
        let matched = {
            let mut pending = self.pending.lock();

            // a re-observation of the same ssrc replaces the stale entry
            pending.retain(|e| e.ssrc != identity.ssrc);

            let pos = if !identity.rsid.is_empty() {
                // incoming repair, look for the base it repairs
                pending
                    .iter()
                    .position(|e| e.mid == identity.mid && !e.rid.is_empty() && e.rid == identity.rsid)
            } else {
                // incoming base, look for a repair waiting on it
                pending
                    .iter()
                    .position(|e| e.mid == identity.mid && !e.rsid.is_empty() && e.rsid == identity.rid)
            };

            match pos {
                Some(pos) => Some(pending.remove(pos)),
                None => {
                    if pending.len() >= self.max_pending {
                        let evicted = pending.remove(0);
                        log::warn!(
                            "rtx pending set full, dropping oldest unpaired stream {}",
                            evicted.ssrc
                        );
                    }
                    pending.push(identity.clone());
                    None
                }
            }
        };

        // the handler may turn around and record more identities, so it must
        // run with the pending lock released
        if let Some(counterpart) = matched {
            let (repair, base) = if !identity.rsid.is_empty() {
                (identity.ssrc, counterpart.ssrc)
            } else {
                (counterpart.ssrc, identity.ssrc)
            };
            if let Some(handler) = &self.on_pair_found {
                handler(repair, base);
            }
        }
    }

    fn forget(&self, ssrc: u32) {
        let mut pending = self.pending.lock();
        pending.retain(|e| e.ssrc != ssrc);
    }
}

/// RtxPairFinder discovers which remote stream is the RTX repair counterpart
/// of which base stream, from the sdes mid/rid/repaired-rid header extensions
/// of the first qualifying packet on each bound stream.
pub struct RtxPairFinder {
    internal: Arc<FinderInternal>,
}

impl RtxPairFinder {
    /// builder returns a new RtxPairFinderBuilder.
    pub fn builder() -> RtxPairFinderBuilder {
        RtxPairFinderBuilder::default()
    }
}

#[async_trait]
impl Interceptor for RtxPairFinder {
    /// bind_rtcp_reader lets you modify any incoming RTCP packets. It is called once per sender/receiver, however this might
    /// change in the future. The returned method will be called once per packet batch.
    async fn bind_rtcp_reader(
        &self,
        reader: Arc<dyn RTCPReader + Send + Sync>,
    ) -> Arc<dyn RTCPReader + Send + Sync> {
        reader
    }

    /// bind_rtcp_writer lets you modify any outgoing RTCP packets. It is called once per PeerConnection. The returned method
    /// will be called once per packet batch.
    async fn bind_rtcp_writer(
        &self,
        writer: Arc<dyn RTCPWriter + Send + Sync>,
    ) -> Arc<dyn RTCPWriter + Send + Sync> {
        writer
    }

    /// bind_local_stream lets you modify any outgoing RTP packets. It is called once for per LocalStream. The returned method
    /// will be called once per rtp packet.
    async fn bind_local_stream(
        &self,
        _info: &StreamInfo,
        writer: Arc<dyn RTPWriter + Send + Sync>,
    ) -> Arc<dyn RTPWriter + Send + Sync> {
        writer
    }

    /// unbind_local_stream is called when the Stream is removed. It can be used to clean up any data related to that track.
    async fn unbind_local_stream(&self, _info: &StreamInfo) {}

    /// bind_remote_stream returns a reader that inspects header extensions
    /// until the stream's identity has been reported once, then passes all
    /// packets through untouched.
    async fn bind_remote_stream(
        &self,
        info: &StreamInfo,
        reader: Arc<dyn RTPReader + Send + Sync>,
    ) -> Arc<dyn RTPReader + Send + Sync> {
        let mid_ext_id = info.header_extension_id(SDES_MID_URI);
        let sid_ext_id = info.header_extension_id(SDES_RTP_STREAM_ID_URI);
        let rsid_ext_id = info.header_extension_id(SDES_REPAIRED_RTP_STREAM_ID_URI);
        if mid_ext_id == 0 || (sid_ext_id == 0 && rsid_ext_id == 0) {
            // without mid plus one of the stream ids this stream can never
            // contribute a pairing
            return reader;
        }

        Arc::new(FinderStream::new(
            reader,
            Arc::clone(&self.internal),
            mid_ext_id,
            sid_ext_id,
            rsid_ext_id,
        ))
    }

    /// unbind_remote_stream is called when the Stream is removed. It can be used to clean up any data related to that track.
    async fn unbind_remote_stream(&self, info: &StreamInfo) {
        self.internal.forget(info.ssrc);
    }

    /// close closes the Interceptor, cleaning up any data if necessary.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
