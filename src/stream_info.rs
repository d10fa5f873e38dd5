use crate::Attributes;

/// RTPHeaderExtension represents a negotiated RFC5285 RTP header extension.
#[derive(Default, Debug, Clone)]
pub struct RTPHeaderExtension {
    pub uri: String,
    pub id: isize,
}

/// StreamInfo is the Context passed when a StreamLocal or StreamRemote has been Binded or Unbinded
#[derive(Default, Debug, Clone)]
pub struct StreamInfo {
    pub id: String,
    pub attributes: Attributes,
    pub ssrc: u32,
    pub payload_type: u8,
    pub rtp_header_extensions: Vec<RTPHeaderExtension>,
    pub mime_type: String,
    pub clock_rate: u32,
}

impl StreamInfo {
    /// header_extension_id returns the negotiated id for the extension uri,
    /// or 0 if the extension was not negotiated for this stream.
    pub fn header_extension_id(&self, uri: &str) -> u8 {
        for e in &self.rtp_header_extensions {
            if e.uri == uri {
                return e.id as u8;
            }
        }
        0
    }
}
