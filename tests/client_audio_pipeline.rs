//! Cross-module client-side audio scenarios: a real
//! `EncodeEngine` feeding real Opus packets through `IngressContext` and
//! into the jitter buffer a remote peer would mix from — exercising the
//! seam between M3 (encode), M5 (ingress demux) and M6 (jitter) together
//! rather than each module's unit tests in isolation.

use std::sync::Arc;

use voicelink::client::capture::{EncodedOutgoing, EncodeEngine};
use voicelink::client::ingress::IngressContext;
use voicelink::client::mixer::{StreamUserRegistry, UserRegistry};
use voicelink::config::{FRAME_SAMPLES, JITTER_TARGET_DELAY};

fn loud_tone() -> Vec<f32> {
    (0..FRAME_SAMPLES).map(|i| ((i as f32) * 0.3).sin() * 0.8).collect()
}

#[test]
fn encoded_voice_flows_through_ingress_into_the_jitter_buffer() {
    let sender_uid = 111;
    let receiver_uid = 222;
    let mut encoder = EncodeEngine::new(sender_uid, 0.02, 64_000, false).unwrap();

    let users = Arc::new(UserRegistry::new());
    let streams = Arc::new(StreamUserRegistry::new());
    let ingress = IngressContext::new(receiver_uid, users.clone(), streams);

    let tone = loud_tone();
    let mut delivered = 0usize;
    for _ in 0..(JITTER_TARGET_DELAY + 2) {
        let packets = encoder.process_frame(&tone, 0.0, false, false).unwrap();
        assert!(!packets.is_empty(), "expected at least one voice packet, got a keep-alive tick");
        for packet in packets {
            match packet {
                EncodedOutgoing::Voice { header, opus } => {
                    assert!(!opus.is_empty(), "a loud tone must not encode to a keep-alive");
                    let mut datagram = header.encode().to_vec();
                    datagram.extend_from_slice(&opus);
                    ingress.handle_datagram(&datagram, 0.0, |_| {}).unwrap();
                    delivered += 1;
                }
                EncodedOutgoing::Whisper { .. } => panic!("expected a voice packet, got a whisper"),
                EncodedOutgoing::StreamAudio { .. } => panic!("broadcast_to_watchers was false, no stream-audio packet expected"),
            }
        }
    }
    assert_eq!(delivered, JITTER_TARGET_DELAY + 2);

    let remote = users.get_or_insert(sender_uid);
    let mut popped = 0usize;
    for _ in 0..delivered {
        if remote.jitter.lock().get().is_some() {
            popped += 1;
        }
    }
    assert!(
        popped >= 2,
        "once past the jitter target delay, frames should start releasing in order"
    );
}

#[test]
fn whisper_packet_is_delivered_and_fires_the_on_whisper_callback() {
    let sender_uid = 111;
    let receiver_uid = 222;
    let mut encoder = EncodeEngine::new(sender_uid, 0.02, 64_000, false).unwrap();
    encoder.start_whisper(receiver_uid);

    let users = Arc::new(UserRegistry::new());
    let streams = Arc::new(StreamUserRegistry::new());
    let ingress = IngressContext::new(receiver_uid, users.clone(), streams);

    let tone = loud_tone();
    let mut packets = encoder.process_frame(&tone, 0.0, false, false).unwrap();
    assert_eq!(packets.len(), 1, "whispering sends exactly one packet per frame");
    let EncodedOutgoing::Whisper { header, target_uid, opus } = packets.remove(0) else {
        panic!("expected a whisper packet while a whisper target is set");
    };
    assert_eq!(target_uid, receiver_uid);

    let mut datagram = header.encode().to_vec();
    datagram.extend_from_slice(&voicelink::proto::prefix_uid(target_uid, &opus));

    let mut whisperer = None;
    ingress.handle_datagram(&datagram, 0.0, |uid| whisperer = Some(uid)).unwrap();
    assert_eq!(whisperer, Some(sender_uid));

    let remote = users.get_or_insert(sender_uid);
    assert!(!remote.jitter.lock().is_empty(), "the whisper payload should have landed in the jitter buffer");
}

#[test]
fn muted_talker_produces_no_outgoing_packet() {
    let mut encoder = EncodeEngine::new(111, 0.02, 64_000, false).unwrap();
    let tone = loud_tone();
    assert!(encoder.process_frame(&tone, 0.0, true, false).unwrap().is_empty());
}

#[test]
fn broadcast_to_watchers_mirrors_the_live_frame_with_stream_audio_flag() {
    let mut encoder = EncodeEngine::new(111, 0.02, 64_000, false).unwrap();
    let tone = loud_tone();
    let packets = encoder.process_frame(&tone, 0.0, false, true).unwrap();
    assert_eq!(packets.len(), 2, "one voice packet plus one mirrored stream-audio packet");

    let EncodedOutgoing::Voice { header: voice_header, opus: voice_opus } = &packets[0] else {
        panic!("first packet should be the normal room-voice frame")
    };
    let EncodedOutgoing::StreamAudio { header: stream_header, opus: stream_opus } = &packets[1] else {
        panic!("second packet should be the mirrored stream-audio frame")
    };
    assert_eq!(stream_header.sequence, voice_header.sequence, "mirrored frame shares the voice sequence number");
    assert_eq!(stream_opus, voice_opus, "mirrored frame carries the same encoded bytes");
    assert_eq!(stream_header.flags, voicelink::proto::FLAG_STREAM_AUDIO);
    assert_eq!(voice_header.flags, 0);
}

#[test]
fn speech_onset_flushes_pre_roll_as_individually_sequenced_packets() {
    use voicelink::config::VAD_PRE_ROLL_FRAMES;

    let mut encoder = EncodeEngine::new(111, 0.1, 64_000, false).unwrap();
    let silence = vec![0.0f32; FRAME_SAMPLES];
    let tone = loud_tone();

    // More silent frames than the pre-roll ring holds, so it's full and
    // wrapping by the time speech starts.
    for i in 0..(VAD_PRE_ROLL_FRAMES + 3) {
        assert!(encoder.process_frame(&silence, i as f64, false, false).unwrap().is_empty());
    }

    let onset = encoder.process_frame(&tone, 100.0, false, false).unwrap();
    assert_eq!(
        onset.len(),
        VAD_PRE_ROLL_FRAMES + 1,
        "onset should flush the full pre-roll ring plus the live frame"
    );

    let mut last_seq = None;
    for packet in &onset {
        let EncodedOutgoing::Voice { header, .. } = packet else {
            panic!("pre-roll flush and onset frame are both plain voice packets")
        };
        if let Some(last) = last_seq {
            assert!(header.sequence > last, "sequence numbers must be strictly increasing");
        }
        last_seq = Some(header.sequence);
    }
}
