use bytes::BufMut;
use util::marshal::{Marshal, MarshalSize, Unmarshal};

pub const PLAYOUT_DELAY_EXTENSION_SIZE: usize = 3;
pub const PLAYOUT_DELAY_MAX_VALUE: u16 = (1 << 12) - 1;

/// PlayoutDelayExtension is the payload of the playout-delay header extension,
/// <http://www.webrtc.org/experiments/rtp-hdrext/playout-delay>. Both fields
/// are 12 bits wide and counted in 10 ms steps.
///
/// 0                   1                   2
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |       MIN delay       |       MAX delay       |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
#[derive(PartialEq, Eq, Debug, Default, Copy, Clone)]
pub struct PlayoutDelayExtension {
    pub min_delay: u16,
    pub max_delay: u16,
}

impl PlayoutDelayExtension {
    pub fn new(min_delay: u16, max_delay: u16) -> Self {
        PlayoutDelayExtension {
            min_delay,
            max_delay,
        }
    }
}

impl MarshalSize for PlayoutDelayExtension {
    fn marshal_size(&self) -> usize {
        PLAYOUT_DELAY_EXTENSION_SIZE
    }
}

impl Marshal for PlayoutDelayExtension {
    fn marshal_to(&self, mut buf: &mut [u8]) -> util::Result<usize> {
        if buf.remaining_mut() < PLAYOUT_DELAY_EXTENSION_SIZE {
            return Err(util::Error::Other(
                "buffer too small for playout delay extension".to_owned(),
            ));
        }
        if self.min_delay > PLAYOUT_DELAY_MAX_VALUE || self.max_delay > PLAYOUT_DELAY_MAX_VALUE {
            return Err(util::Error::Other(
                "playout delay exceeds the 12-bit extension range".to_owned(),
            ));
        }

        buf.put_u8((self.min_delay >> 4) as u8);
        buf.put_u8(((self.min_delay << 4) as u8) | (self.max_delay >> 8) as u8);
        buf.put_u8(self.max_delay as u8);

        Ok(PLAYOUT_DELAY_EXTENSION_SIZE)
    }
}

impl Unmarshal for PlayoutDelayExtension {
    fn unmarshal<B>(buf: &mut B) -> util::Result<Self>
    where
        Self: Sized,
        B: bytes::Buf,
    {
        if buf.remaining() < PLAYOUT_DELAY_EXTENSION_SIZE {
            return Err(util::Error::Other(
                "buffer too small for playout delay extension".to_owned(),
            ));
        }

        let b0 = buf.get_u8();
        let b1 = buf.get_u8();
        let b2 = buf.get_u8();

        let min_delay = u16::from_be_bytes([b0, b1]) >> 4;
        let max_delay = u16::from_be_bytes([b1, b2]) & 0x0FFF;

        Ok(PlayoutDelayExtension {
            min_delay,
            max_delay,
        })
    }
}
