//! Versioned wire codec for weft messages
//!
//! Layout: `version:i32, type:i32`, then the shared version-0 fields with the
//! variant-specific fields interleaved immediately after them, then the
//! version-gated tails (`other_fields` for v>=1, tenant routing for v>=2).
//! The tails are shared across variants and written exactly once. Decoding is
//! conditioned on the received version so short messages from older senders
//! parse cleanly.
//!
//! All integers are big-endian. Strings and payloads are u32-length-prefixed;
//! string lists are u32-count-prefixed.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, WeftError};
use crate::message::{ErrorResponse, Event, Header, Message, MessageType, Request, Response};

/// Encode a message into its wire representation.
pub fn encode(message: &Message) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(64 + message.header().payload.len());
    let header = message.header();

    buf.put_i32(header.version);
    buf.put_i32(message.message_type() as i32);
    put_header_v0(&mut buf, header);

    // Variant fields sit inside the version-0 section, before the tails.
    match message {
        Message::Event(_) => {}
        Message::Request(request) => {
            put_str(&mut buf, &request.reply_to_topic);
            put_str(&mut buf, &request.service_id);
        }
        Message::Response(response) => {
            put_str(&mut buf, &response.request_message_id);
            put_str(&mut buf, &response.service_id);
        }
        Message::Error(error) => {
            put_str(&mut buf, &error.request_message_id);
            put_str(&mut buf, &error.service_id);
            buf.put_i32(error.error_code);
            put_str(&mut buf, &error.error_message);
        }
    }

    if header.version > 0 {
        put_other_fields(&mut buf, &header.other_fields);
    }
    if header.version > 1 {
        put_str(&mut buf, &header.source_tenant_guid);
        put_str_list(&mut buf, &header.destination_tenant_guids);
    }

    Ok(buf.freeze())
}

/// Decode a wire message. The destination topic is not part of the frame; the
/// caller stamps it from the transport topic the bytes arrived on.
pub fn decode(raw: &[u8]) -> Result<Message> {
    let mut buf = raw;
    let version = get_i32(&mut buf)?;
    let tag = get_i32(&mut buf)?;
    let message_type = MessageType::from_wire(tag)
        .ok_or_else(|| WeftError::Protocol(format!("unknown message type: {tag}")))?;

    let mut header = get_header_v0(&mut buf, version)?;

    let message = match message_type {
        MessageType::Event => {
            get_tails(&mut buf, &mut header)?;
            Message::Event(Event { header })
        }
        MessageType::Request => {
            let reply_to_topic = get_str(&mut buf)?;
            let service_id = get_str(&mut buf)?;
            get_tails(&mut buf, &mut header)?;
            Message::Request(Request {
                header,
                reply_to_topic,
                service_id,
            })
        }
        MessageType::Response => {
            let request_message_id = get_str(&mut buf)?;
            let service_id = get_str(&mut buf)?;
            get_tails(&mut buf, &mut header)?;
            Message::Response(Response {
                header,
                request_message_id,
                service_id,
            })
        }
        MessageType::Error => {
            let request_message_id = get_str(&mut buf)?;
            let service_id = get_str(&mut buf)?;
            let error_code = get_i32(&mut buf)?;
            let error_message = get_str(&mut buf)?;
            get_tails(&mut buf, &mut header)?;
            Message::Error(ErrorResponse {
                header,
                request_message_id,
                service_id,
                error_code,
                error_message,
            })
        }
    };

    Ok(message)
}

fn put_header_v0(buf: &mut BytesMut, header: &Header) {
    put_str(buf, &header.message_id);
    put_str(buf, &header.source_client_id);
    put_str(buf, &header.source_broker_id);
    put_str_list(buf, &header.broker_ids);
    put_str_list(buf, &header.client_ids);
    put_payload(buf, &header.payload);
}

fn get_header_v0(buf: &mut &[u8], version: i32) -> Result<Header> {
    let mut header = Header::new("");
    header.version = version;
    header.message_id = get_str(buf)?;
    header.source_client_id = get_str(buf)?;
    header.source_broker_id = get_str(buf)?;
    header.broker_ids = get_str_list(buf)?;
    header.client_ids = get_str_list(buf)?;
    header.payload = get_payload(buf)?;
    Ok(header)
}

// Shared v1/v2 tails, read only when the sender's version carries them.
fn get_tails(buf: &mut &[u8], header: &mut Header) -> Result<()> {
    if header.version > 0 {
        header.other_fields = get_other_fields(buf)?;
    }
    if header.version > 1 {
        header.source_tenant_guid = get_str(buf)?;
        header.destination_tenant_guids = get_str_list(buf)?;
    }
    Ok(())
}

fn put_str(buf: &mut BytesMut, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn put_payload(buf: &mut BytesMut, value: &Bytes) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

fn put_str_list(buf: &mut BytesMut, values: &[String]) {
    buf.put_u32(values.len() as u32);
    for value in values {
        put_str(buf, value);
    }
}

// The v1 section is a flattened alternating key/value sequence, preserving
// the insertion order of the map.
fn put_other_fields(buf: &mut BytesMut, fields: &[(String, String)]) {
    buf.put_u32((fields.len() * 2) as u32);
    for (key, value) in fields {
        put_str(buf, key);
        put_str(buf, value);
    }
}

fn get_i32(buf: &mut &[u8]) -> Result<i32> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_i32())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_u32())
}

fn get_str(buf: &mut &[u8]) -> Result<String> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(truncated());
    }
    let value = String::from_utf8(buf[..len].to_vec())
        .map_err(|_| WeftError::Protocol("invalid utf-8 in string field".to_string()))?;
    buf.advance(len);
    Ok(value)
}

fn get_payload(buf: &mut &[u8]) -> Result<Bytes> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(truncated());
    }
    let value = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(value)
}

fn get_str_list(buf: &mut &[u8]) -> Result<Vec<String>> {
    let count = get_u32(buf)? as usize;
    let mut values = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        values.push(get_str(buf)?);
    }
    Ok(values)
}

fn get_other_fields(buf: &mut &[u8]) -> Result<Vec<(String, String)>> {
    let flattened = get_u32(buf)? as usize;
    if flattened % 2 != 0 {
        return Err(WeftError::Protocol(
            "odd number of entries in other_fields section".to_string(),
        ));
    }
    let mut fields = Vec::with_capacity((flattened / 2).min(1024));
    for _ in 0..flattened / 2 {
        let key = get_str(buf)?;
        let value = get_str(buf)?;
        fields.push((key, value));
    }
    Ok(fields)
}

fn truncated() -> WeftError {
    WeftError::Protocol("truncated message".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated_header(topic: &str, version: i32) -> Header {
        let mut header = Header::new(topic);
        header.version = version;
        header.payload = Bytes::from_static(b"payload bytes");
        header.source_client_id = "client-1".to_string();
        header.source_broker_id = "broker-1".to_string();
        header.broker_ids = vec!["broker-1".to_string(), "broker-2".to_string()];
        header.client_ids = vec!["client-7".to_string()];
        if version > 0 {
            header.other_fields = vec![
                ("first".to_string(), "1".to_string()),
                ("second".to_string(), "2".to_string()),
            ];
        }
        if version > 1 {
            header.source_tenant_guid = "tenant-src".to_string();
            header.destination_tenant_guids =
                vec!["tenant-a".to_string(), "tenant-b".to_string()];
        }
        header
    }

    // Decoded messages carry no destination topic; the transport topic is
    // stamped by the reader. Clear it before comparing round trips.
    fn strip_topic(mut message: Message) -> Message {
        message.header_mut().destination_topic = String::new();
        message
    }

    #[test]
    fn test_event_round_trip_all_versions() {
        for version in 0..=2 {
            let event = Event {
                header: populated_header("/some/topic", version),
            };
            let encoded = encode(&Message::Event(event.clone())).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(
                decoded,
                strip_topic(Message::Event(event)),
                "version {version}"
            );
        }
    }

    #[test]
    fn test_request_round_trip() {
        let request = Request {
            header: populated_header("/svc/op", 2),
            reply_to_topic: "/weft/client/abc".to_string(),
            service_id: "svc-9".to_string(),
        };
        let encoded = encode(&Message::Request(request.clone())).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, strip_topic(Message::Request(request)));
    }

    #[test]
    fn test_response_round_trip() {
        let response = Response {
            header: populated_header("/weft/client/abc", 2),
            request_message_id: "req-42".to_string(),
            service_id: "svc-9".to_string(),
        };
        let encoded = encode(&Message::Response(response.clone())).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, strip_topic(Message::Response(response)));
    }

    #[test]
    fn test_error_response_round_trip() {
        let error = ErrorResponse {
            header: populated_header("/weft/client/abc", 2),
            request_message_id: "req-42".to_string(),
            service_id: "svc-9".to_string(),
            error_code: -2147483648,
            error_message: "fabric unavailable".to_string(),
        };
        let encoded = encode(&Message::Error(error.clone())).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, strip_topic(Message::Error(error)));
    }

    #[test]
    fn test_unknown_type_tag_is_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_i32(2);
        buf.put_i32(9);
        let err = decode(&buf).unwrap_err();
        assert!(matches!(err, WeftError::Protocol(_)));
        assert!(err.to_string().contains("unknown message type"));
    }

    #[test]
    fn test_truncated_input_is_protocol_error() {
        let event = Event::new("/t");
        let encoded = encode(&Message::Event(event)).unwrap();
        for cut in [0, 3, 7, encoded.len() - 1] {
            let err = decode(&encoded[..cut]).unwrap_err();
            assert!(matches!(err, WeftError::Protocol(_)), "cut at {cut}");
        }
    }

    #[test]
    fn test_version_zero_sender_omits_tails() {
        // A v0 frame must decode even though it carries no v1/v2 sections.
        let mut event = Event::new("/t");
        event.header.version = 0;
        let encoded = encode(&Message::Event(event)).unwrap();
        let decoded = decode(&encoded).unwrap();
        let header = decoded.header();
        assert_eq!(header.version, 0);
        assert!(header.other_fields.is_empty());
        assert!(header.source_tenant_guid.is_empty());
        assert!(header.destination_tenant_guids.is_empty());
    }

    #[test]
    fn test_version_one_sender_omits_tenant_tail() {
        let mut event = Event::new("/t");
        event.header.version = 1;
        event.header.other_fields = vec![("k".to_string(), "v".to_string())];
        let encoded = encode(&Message::Event(event)).unwrap();
        let decoded = decode(&encoded).unwrap();
        let header = decoded.header();
        assert_eq!(header.other_fields, vec![("k".to_string(), "v".to_string())]);
        assert!(header.source_tenant_guid.is_empty());
    }

    #[test]
    fn test_odd_other_fields_count_rejected() {
        let mut event = Event::new("/t");
        event.header.version = 1;
        let mut encoded = BytesMut::from(&encode(&Message::Event(event)).unwrap()[..]);
        // The other_fields count is the last u32 in this frame; make it odd.
        let len = encoded.len();
        encoded[len - 4..].copy_from_slice(&1u32.to_be_bytes());
        let err = decode(&encoded).unwrap_err();
        assert!(matches!(err, WeftError::Protocol(_)));
    }

    #[test]
    fn test_empty_payload_round_trip() {
        let event = Event::new("/t");
        let encoded = encode(&Message::Event(event.clone())).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert!(decoded.header().payload.is_empty());
        assert_eq!(decoded.header().message_id, event.header.message_id);
    }

    #[test]
    fn test_non_utf8_string_rejected() {
        let event = Event::new("/t");
        let encoded = encode(&Message::Event(event)).unwrap();
        let mut bytes = encoded.to_vec();
        // Byte 12 sits inside the uuid string field.
        bytes[12] = 0xff;
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, WeftError::Protocol(_)));
    }
}
