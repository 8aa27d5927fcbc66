use super::*;

#[test]
fn decodes_message_frame_with_json_body() {
    let raw = "MESSAGE\ndestination:/user/42/inbox\nsubscription:sub-0\nmessage-id:9\n\n{\"id\":1}\0";
    let frames = decode_all(raw).expect("decode");
    assert_eq!(frames.len(), 1);
    let frame = &frames[0];
    assert_eq!(frame.command, Command::Message);
    assert_eq!(frame.header("destination"), Some("/user/42/inbox"));
    assert_eq!(frame.body, "{\"id\":1}");
}

#[test]
fn skips_heartbeats_between_frames() {
    let raw = "\n\r\nRECEIPT\nreceipt-id:1\n\n\0\nMESSAGE\ndestination:/x\n\nhi\0\n";
    let frames = decode_all(raw).expect("decode");
    let commands: Vec<_> = frames.iter().map(|frame| frame.command).collect();
    assert_eq!(commands, vec![Command::Receipt, Command::Message]);
    assert!(decode_all("\n\n").expect("heartbeat only").is_empty());
}

#[test]
fn honours_content_length_with_embedded_nul() {
    let raw = "MESSAGE\ncontent-length:3\n\na\0b\0";
    let frames = decode_all(raw).expect("decode");
    assert_eq!(frames[0].body, "a\0b");
}

#[test]
fn content_length_beyond_input_is_rejected() {
    assert_eq!(
        decode_all("MESSAGE\ncontent-length:18446744073709551615\n\nx\0"),
        Err(StompError::InvalidContentLength("18446744073709551615".to_string()))
    );
    assert_eq!(
        decode_all("MESSAGE\ncontent-length:40\n\nshort\0"),
        Err(StompError::InvalidContentLength("40".to_string()))
    );
    assert_eq!(
        decode_all("MESSAGE\ncontent-length:2\n\nabc\0"),
        Err(StompError::MissingTerminator)
    );
}

#[test]
fn content_length_counts_bytes_on_encode() {
    let encoded = Frame::send_json("/chat/message", "héllo").encode();
    assert!(encoded.contains("content-length:6\n"), "{encoded}");
    let decoded = decode_all(&encoded).expect("decode");
    assert_eq!(decoded[0].body, "héllo");
}

#[test]
fn escapes_header_values_outside_connect() {
    let frame = Frame::new(Command::Send).with_header("note", "a:b\nc\\d");
    let encoded = frame.encode();
    assert!(encoded.contains("note:a\\cb\\nc\\\\d\n"), "{encoded}");
    let decoded = decode_all(&encoded).expect("decode");
    assert_eq!(decoded[0].header("note"), Some("a:b\nc\\d"));
}

#[test]
fn connected_headers_are_taken_verbatim() {
    let frames =
        decode_all("CONNECTED\nversion:1.2\nserver:broker\\x\nheart-beat:0,5000\n\n\0")
            .expect("decode");
    assert_eq!(frames[0].header("server"), Some("broker\\x"));
}

#[test]
fn rejects_malformed_frames() {
    assert_eq!(
        decode_all("BOGUS\n\n\0"),
        Err(StompError::UnknownCommand("BOGUS".to_string()))
    );
    assert_eq!(decode_all("MESSAGE\ndestination:/x\n\nbody"), Err(StompError::MissingTerminator));
    assert_eq!(decode_all("MESSAGE\ndestination"), Err(StompError::Truncated));
    assert_eq!(
        decode_all("MESSAGE\nnocolon\n\n\0"),
        Err(StompError::MalformedHeader("nocolon".to_string()))
    );
    assert_eq!(
        decode_all("MESSAGE\nbad:\\t\n\n\0"),
        Err(StompError::InvalidEscape("\\t".to_string()))
    );
    assert_eq!(
        decode_all("MESSAGE\ncontent-length:ten\n\n\0"),
        Err(StompError::InvalidContentLength("ten".to_string()))
    );
}

#[test]
fn first_repeated_header_wins() {
    let frames = decode_all("MESSAGE\nfoo:1\nfoo:2\n\n\0").expect("decode");
    assert_eq!(frames[0].header("foo"), Some("1"));
}

#[test]
fn connect_frame_offers_outgoing_heartbeat_only() {
    let encoded = Frame::connect("chat.example.edu", Duration::from_secs(10)).encode();
    assert_eq!(
        encoded,
        "CONNECT\naccept-version:1.2\nhost:chat.example.edu\nheart-beat:10000,0\n\n\0"
    );
}

#[test]
fn negotiates_outgoing_heartbeat() {
    let offered = Duration::from_millis(10_000);
    assert_eq!(
        negotiate_outgoing_heartbeat(offered, Some("0,20000")),
        Some(Duration::from_millis(20_000))
    );
    assert_eq!(
        negotiate_outgoing_heartbeat(offered, Some("0,4000")),
        Some(offered)
    );
    assert_eq!(negotiate_outgoing_heartbeat(offered, Some("5000,0")), None);
    assert_eq!(negotiate_outgoing_heartbeat(offered, None), None);
    assert_eq!(
        negotiate_outgoing_heartbeat(Duration::ZERO, Some("0,4000")),
        None
    );
}
