use std::sync::Arc;

use bytes::Bytes;
use rtcp::receiver_report::ReceiverReport;
use rtcp::reception_report::ReceptionReport;
use tokio::time::Duration;
use util::{Marshal, Unmarshal};

use super::*;
use crate::mock::mock_stream::MockStream;
use crate::stream_info::RTPHeaderExtension;
use crate::test::timeout_or_fail;

const DELAY_EXT_ID: isize = 5;

fn decode(payload: &Bytes) -> PlayoutDelayExtension {
    let mut b = &payload[..];
    PlayoutDelayExtension::unmarshal(&mut b).expect("a valid payload")
}

#[test]
fn test_extension_marshal_roundtrip() {
    let ext = PlayoutDelayExtension::new(10, 4095);
    let payload = ext.marshal().expect("marshal");

    assert_eq!(payload.len(), PLAYOUT_DELAY_EXTENSION_SIZE);
    assert_eq!(&payload[..], &[0x00, 0xAF, 0xFF]);

    let mut b = &payload[..];
    assert_eq!(
        PlayoutDelayExtension::unmarshal(&mut b).expect("unmarshal"),
        ext
    );
}

#[test]
fn test_extension_rejects_out_of_range() {
    assert!(PlayoutDelayExtension::new(PLAYOUT_DELAY_MAX_VALUE + 1, 0)
        .marshal()
        .is_err());
    assert!(PlayoutDelayExtension::new(0, PLAYOUT_DELAY_MAX_VALUE + 1)
        .marshal()
        .is_err());

    let mut short = &[0u8, 0u8][..];
    assert!(PlayoutDelayExtension::unmarshal(&mut short).is_err());
}

#[test]
fn test_controller_asymmetric_smoothing() {
    let c = PlayoutDelayController::new(100, 1000).expect("a controller");
    assert_eq!(c.current_delay(), 100);

    // jitter 20ms maps to target 500, raised by 3/4 of the gap
    c.set_jitter(20);
    assert_eq!(c.current_delay(), 400);

    // jitter 4ms maps to target 100, lowered by only 1/5 of the gap
    c.set_jitter(4);
    assert_eq!(c.current_delay(), 340);
}

#[test]
fn test_controller_clamps_to_bounds() {
    let c = PlayoutDelayController::new(100, 1000).expect("a controller");

    c.set_jitter(10_000);
    assert_eq!(c.current_delay(), 1000);

    // an unchanged result keeps the state machine untouched
    let c = PlayoutDelayController::new(500, 1000).expect("a controller");
    let _ = c.next_extension(1);
    c.on_seq_acked(1);
    assert_eq!(c.state(), PlayoutDelayState::Acked);
    c.set_jitter(0);
    assert_eq!(c.current_delay(), 500);
    assert_eq!(c.state(), PlayoutDelayState::Acked);
}

#[test]
fn test_controller_extreme_jitter() {
    let c = PlayoutDelayController::new(100, 1000).expect("a controller");

    c.set_jitter(u32::MAX);
    assert_eq!(c.current_delay(), 1000);

    c.set_jitter(0);
    assert_eq!(c.current_delay(), 800);
}

#[test]
fn test_controller_state_machine() {
    let c = PlayoutDelayController::new(0, 0).expect("a controller");
    assert_eq!(c.state(), PlayoutDelayState::Changed);

    let payload = c.next_extension(100).expect("payload in Changed");
    assert_eq!(payload.len(), PLAYOUT_DELAY_EXTENSION_SIZE);
    assert_eq!(c.state(), PlayoutDelayState::Sending);

    // retransmitted on every packet while unconfirmed
    assert!(c.next_extension(101).is_some());

    // an ack from before the announcement is ignored
    c.on_seq_acked(99);
    assert_eq!(c.state(), PlayoutDelayState::Sending);

    c.on_seq_acked(100);
    assert_eq!(c.state(), PlayoutDelayState::Acked);
    assert!(c.next_extension(101).is_none());
}

#[test]
fn test_controller_ack_window_wraparound() {
    let c = PlayoutDelayController::new(0, 0).expect("a controller");

    assert!(c.next_extension(65500).is_some());
    c.on_seq_acked(10);
    assert_eq!(c.state(), PlayoutDelayState::Acked);
}

#[test]
fn test_controller_change_reannounces_after_ack() {
    let c = PlayoutDelayController::new(0, 1000).expect("a controller");

    assert!(c.next_extension(7).is_some());
    c.on_seq_acked(7);
    assert_eq!(c.state(), PlayoutDelayState::Acked);

    c.set_jitter(20);
    assert_eq!(c.state(), PlayoutDelayState::Changed);

    let payload = c.next_extension(8).expect("payload after change");
    assert_eq!(decode(&payload).min_delay as u32, c.current_delay() / 10);
}

#[test]
fn test_controller_default_max() {
    let c = PlayoutDelayController::new(0, 0).expect("a controller");
    let payload = c.next_extension(0).expect("payload");
    assert_eq!(decode(&payload).max_delay, PLAYOUT_DELAY_MAX_VALUE);

    let c = PlayoutDelayController::new(0, PLAYOUT_DELAY_DEFAULT_MAX + 1).expect("a controller");
    let payload = c.next_extension(0).expect("payload");
    assert_eq!(decode(&payload).max_delay, PLAYOUT_DELAY_MAX_VALUE);
}

fn delay_stream_info(ssrc: u32) -> StreamInfo {
    StreamInfo {
        ssrc,
        rtp_header_extensions: vec![RTPHeaderExtension {
            uri: PLAYOUT_DELAY_URI.to_owned(),
            id: DELAY_EXT_ID,
        }],
        ..Default::default()
    }
}

fn seq_packet(seq: u16) -> rtp::packet::Packet {
    rtp::packet::Packet {
        header: rtp::header::Header {
            version: 2,
            ssrc: 1,
            sequence_number: seq,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_playout_delay_interceptor() -> crate::error::Result<()> {
    let icpr = make_playout_delay_interceptor(0, 0);

    let stream = MockStream::new(
        &delay_stream_info(1),
        Arc::clone(&icpr) as Arc<dyn Interceptor + Send + Sync>,
    )
    .await;

    // the initial value rides on every packet until acked
    stream.write_rtp(&seq_packet(100)).await?;
    let pkt = timeout_or_fail(Duration::from_millis(50), stream.written_rtp())
        .await
        .expect("a packet");
    let payload = pkt
        .header
        .get_extension(DELAY_EXT_ID as u8)
        .expect("a delay extension");
    assert_eq!(decode(&payload).min_delay, 0);

    // a receiver report for the announced sequence number acks the value
    stream
        .receive_rtcp(vec![Box::new(ReceiverReport {
            reports: vec![ReceptionReport {
                ssrc: 1,
                last_sequence_number: 100,
                ..Default::default()
            }],
            ..Default::default()
        })])
        .await;
    let pkts = timeout_or_fail(Duration::from_millis(50), stream.read_rtcp())
        .await
        .expect("an rtcp batch")?;
    assert_eq!(pkts.len(), 1);

    stream.write_rtp(&seq_packet(101)).await?;
    let pkt = timeout_or_fail(Duration::from_millis(50), stream.written_rtp())
        .await
        .expect("a packet");
    assert!(pkt.header.get_extension(DELAY_EXT_ID as u8).is_none());

    // a jitter update re-announces the new value
    icpr.set_jitter(1, 20);
    stream.write_rtp(&seq_packet(102)).await?;
    let pkt = timeout_or_fail(Duration::from_millis(50), stream.written_rtp())
        .await
        .expect("a packet");
    let payload = pkt
        .header
        .get_extension(DELAY_EXT_ID as u8)
        .expect("a delay extension");
    assert_eq!(decode(&payload).min_delay as u32, 375 / 10);

    stream.close().await?;

    Ok(())
}

#[tokio::test]
async fn test_playout_delay_builder() -> crate::error::Result<()> {
    let builder = PlayoutDelayBuilder::default()
        .with_min_delay(200)
        .with_max_delay(1000);
    assert!(builder.build("").is_ok());

    let icpr = builder.build_playout_delay();
    let stream = MockStream::new(
        &delay_stream_info(1),
        Arc::clone(&icpr) as Arc<dyn Interceptor + Send + Sync>,
    )
    .await;

    let controller = icpr.controller(1).expect("a controller");
    assert_eq!(controller.current_delay(), 200);

    stream.write_rtp(&seq_packet(1)).await?;
    let pkt = timeout_or_fail(Duration::from_millis(50), stream.written_rtp())
        .await
        .expect("a packet");
    let payload = pkt
        .header
        .get_extension(DELAY_EXT_ID as u8)
        .expect("a delay extension");
    assert_eq!(decode(&payload).min_delay, 20);
    assert_eq!(decode(&payload).max_delay, 100);

    stream.close().await?;

    Ok(())
}

#[tokio::test]
async fn test_playout_delay_skips_unnegotiated_stream() -> crate::error::Result<()> {
    let icpr = make_playout_delay_interceptor(0, 0);

    let stream = MockStream::new(
        &StreamInfo {
            ssrc: 1,
            ..Default::default()
        },
        Arc::clone(&icpr) as Arc<dyn Interceptor + Send + Sync>,
    )
    .await;

    assert!(icpr.controller(1).is_none());

    stream.write_rtp(&seq_packet(1)).await?;
    let pkt = timeout_or_fail(Duration::from_millis(50), stream.written_rtp())
        .await
        .expect("a packet");
    assert!(!pkt.header.extension);

    stream.close().await?;

    Ok(())
}

#[tokio::test]
async fn test_playout_delay_unbind_removes_controller() {
    let icpr = make_playout_delay_interceptor(0, 0);

    let stream = MockStream::new(
        &delay_stream_info(1),
        Arc::clone(&icpr) as Arc<dyn Interceptor + Send + Sync>,
    )
    .await;
    assert!(icpr.controller(1).is_some());

    icpr.unbind_local_stream(&delay_stream_info(1)).await;
    assert!(icpr.controller(1).is_none());

    let _ = stream.close().await;
}
