use base64::Engine;
use streamscribe::events::{
    AckMessage, AudioChunkMessage, ErrorEventMessage, JoinSessionMessage, TranscriptEventMessage,
};

#[test]
fn test_audio_chunk_serialization() {
    let msg = AudioChunkMessage {
        session_id: "meeting-42".to_string(),
        sequence: 0,
        audio: base64::engine::general_purpose::STANDARD.encode([0u8; 100]),
        mime: "audio/webm".to_string(),
        timestamp: "2026-08-07T10:30:00Z".to_string(),
        final_chunk: false,
    };

    let json = serde_json::to_string(&msg).unwrap();
    assert!(json.contains("meeting-42"));
    assert!(json.contains("audio/webm"));
    assert!(json.contains("\"final\":false"));
    assert!(json.contains("\"sequence\":0"));

    let deserialized: AudioChunkMessage = serde_json::from_str(&json).unwrap();
    assert_eq!(deserialized.session_id, "meeting-42");
    assert_eq!(deserialized.sequence, 0);
    assert!(!deserialized.final_chunk);
}

#[test]
fn test_audio_chunk_final_marker() {
    let json = r#"{
        "session_id": "meeting-42",
        "sequence": 10,
        "audio": "",
        "mime": "audio/wav",
        "timestamp": "2026-08-07T10:30:00Z",
        "final": true
    }"#;

    let msg: AudioChunkMessage = serde_json::from_str(json).unwrap();
    assert!(msg.final_chunk);
    assert!(msg.audio.is_empty());
    assert_eq!(msg.sequence, 10);
}

#[test]
fn test_audio_chunk_defaults() {
    // Clients may omit the mime hint and the final flag.
    let json = r#"{
        "session_id": "meeting-42",
        "sequence": 3,
        "audio": "AAAA",
        "timestamp": "2026-08-07T10:30:00Z"
    }"#;

    let msg: AudioChunkMessage = serde_json::from_str(json).unwrap();
    assert_eq!(msg.mime, "");
    assert!(!msg.final_chunk);
}

#[test]
fn test_join_message_optional_identity() {
    let json = r#"{
        "session_id": "meeting-42",
        "connection_id": "conn-1"
    }"#;

    let msg: JoinSessionMessage = serde_json::from_str(json).unwrap();
    assert_eq!(msg.connection_id, "conn-1");
    assert_eq!(msg.client_identity, None);
}

#[test]
fn test_transcript_event_serialization() {
    let msg = TranscriptEventMessage {
        session_id: "meeting-42".to_string(),
        text: "Hello world.".to_string(),
        is_final: true,
        confidence: 0.95,
        sequence: 7,
        latency_ms: 420,
        timestamp: "2026-08-07T10:30:05Z".to_string(),
    };

    let json = serde_json::to_string(&msg).unwrap();
    assert!(json.contains("\"final\":true"));
    assert!(json.contains("\"latency_ms\":420"));

    let deserialized: TranscriptEventMessage = serde_json::from_str(&json).unwrap();
    assert_eq!(deserialized.text, "Hello world.");
    assert_eq!(deserialized.sequence, 7);
    assert!(deserialized.is_final);
}

#[test]
fn test_error_event_omits_absent_retry_after() {
    let msg = ErrorEventMessage {
        session_id: "meeting-42".to_string(),
        kind: "invalid_audio".to_string(),
        message: "too small".to_string(),
        retry_after_ms: None,
        timestamp: "2026-08-07T10:30:05Z".to_string(),
    };

    let json = serde_json::to_string(&msg).unwrap();
    assert!(!json.contains("retry_after_ms"));

    let msg = ErrorEventMessage {
        retry_after_ms: Some(1500),
        ..msg
    };
    let json = serde_json::to_string(&msg).unwrap();
    assert!(json.contains("\"retry_after_ms\":1500"));
}

#[test]
fn test_ack_roundtrip() {
    let msg = AckMessage {
        session_id: "meeting-42".to_string(),
        sequence: 12,
        queue_depth: 3,
    };

    let json = serde_json::to_string(&msg).unwrap();
    let deserialized: AckMessage = serde_json::from_str(&json).unwrap();
    assert_eq!(deserialized.sequence, 12);
    assert_eq!(deserialized.queue_depth, 3);
}

#[test]
fn test_pcm_encoding_roundtrip() {
    let original_samples: Vec<i16> = vec![100, -200, 300, -400];

    let pcm_bytes: Vec<u8> = original_samples.iter().flat_map(|&s| s.to_le_bytes()).collect();
    let encoded = base64::engine::general_purpose::STANDARD.encode(&pcm_bytes);

    let msg = AudioChunkMessage {
        session_id: "test".to_string(),
        sequence: 0,
        audio: encoded,
        mime: "audio/wav".to_string(),
        timestamp: "2026-08-07T10:30:00Z".to_string(),
        final_chunk: false,
    };

    let json = serde_json::to_string(&msg).unwrap();
    let deserialized: AudioChunkMessage = serde_json::from_str(&json).unwrap();

    let decoded_bytes = base64::engine::general_purpose::STANDARD
        .decode(&deserialized.audio)
        .unwrap();
    let decoded_samples: Vec<i16> = decoded_bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect();

    assert_eq!(decoded_samples, original_samples);
}
