use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use util::Unmarshal;

use super::{FinderInternal, StreamIdentity};
use crate::error::Result;
use crate::{Attributes, RTPReader};

pub(super) struct FinderStream {
    parent_rtp_reader: Arc<dyn RTPReader + Send + Sync>,
    internal: Arc<FinderInternal>,

    mid_ext_id: u8,
    sid_ext_id: u8,
    rsid_ext_id: u8,

    done: AtomicBool,
}

impl FinderStream {
    pub(super) fn new(
        reader: Arc<dyn RTPReader + Send + Sync>,
        internal: Arc<FinderInternal>,
        mid_ext_id: u8,
        sid_ext_id: u8,
        rsid_ext_id: u8,
    ) -> Self {
        FinderStream {
            parent_rtp_reader: reader,
            internal,
            mid_ext_id,
            sid_ext_id,
            rsid_ext_id,
            done: AtomicBool::new(false),
        }
    }

    fn extension_text(&self, pkt: &rtp::packet::Packet, ext_id: u8) -> String {
        if ext_id == 0 {
            return String::new();
        }
        pkt.header
            .get_extension(ext_id)
            .map(|payload| String::from_utf8_lossy(&payload).into_owned())
            .unwrap_or_default()
    }
}

/// RTPReader is used by Interceptor.bind_remote_stream.
#[async_trait]
impl RTPReader for FinderStream {
    /// read a rtp packet, reporting this stream's identity as a side effect of
    /// the first packet that carries mid plus rid or repaired-rid. The read
    /// result is always handed back unchanged, a packet that fails to parse is
    /// simply not inspected.
    async fn read(&self, buf: &mut [u8], a: &Attributes) -> Result<(usize, Attributes)> {
        let (n, attr) = self.parent_rtp_reader.read(buf, a).await?;
        if self.done.load(Ordering::Acquire) {
            return Ok((n, attr));
        }

        let mut b = &buf[..n];
        let pkt = match rtp::packet::Packet::unmarshal(&mut b) {
            Ok(pkt) => pkt,
            Err(_) => return Ok((n, attr)),
        };
        if !pkt.header.extension {
            return Ok((n, attr));
        }

        let mid = self.extension_text(&pkt, self.mid_ext_id);
        let rid = self.extension_text(&pkt, self.sid_ext_id);
        let rsid = self.extension_text(&pkt, self.rsid_ext_id);

        if !mid.is_empty() && (!rid.is_empty() || !rsid.is_empty()) {
            self.done.store(true, Ordering::Release);
            self.internal.record(StreamIdentity {
                ssrc: pkt.header.ssrc,
                mid,
                rid,
                rsid,
            });
        }

        Ok((n, attr))
    }
}
