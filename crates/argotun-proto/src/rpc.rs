//! Control-stream RPC: tunnel registration.
//!
//! The control stream speaks a minimal subset of the Cap'n Proto RPC
//! protocol: the client sends a Bootstrap message (question 0) immediately
//! followed by a Call (question 1) addressed to the *answer* of question 0
//! (capability pipelining), so the server's root capability is never
//! materialized client-side. The server replies with Return messages; only
//! the Return carrying a `ConnectionResponse` is meaningful here.

use tracing::debug;
use uuid::Uuid;

use crate::codec::{CodecError, MessageBuilder, MessageReader};
use crate::{
    ConnectionOptions, RegistrationResult, TunnelAuth, REGISTER_CONNECTION_METHOD_ID,
    TUNNEL_SERVER_INTERFACE_ID,
};

/// `Message` union discriminants (rpc.capnp generated layout).
pub const MSG_CALL: u16 = 2;
pub const MSG_RETURN: u16 = 3;
pub const MSG_BOOTSTRAP: u16 = 8;

/// `Return` union discriminants.
pub const RETURN_RESULTS: u16 = 0;
pub const RETURN_EXCEPTION: u16 = 1;
pub const RETURN_CANCELED: u16 = 2;

/// `MessageTarget` union discriminant for a pipelined answer.
pub const TARGET_PROMISED_ANSWER: u16 = 1;

/// `ConnectionResponse` union discriminants.
pub const RESPONSE_ERROR: u16 = 0;
pub const RESPONSE_CONNECTION_DETAILS: u16 = 1;

/// Control-stream decode errors. `UnexpectedMessage` and friends mean "not
/// the Return we are waiting for"; callers skip such messages.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("unexpected RPC message discriminant {0}")]
    UnexpectedMessage(u16),

    #[error("unknown Return discriminant {0}")]
    UnknownReturn(u16),

    #[error("unknown ConnectionResponse discriminant {0}")]
    UnknownResponse(u16),

    #[error("Return carries no usable payload")]
    MissingPayload,
}

/// Encode the registration request pair: a framed Bootstrap message
/// followed by a framed Call message, concatenated.
pub fn encode_register(
    auth: &TunnelAuth,
    tunnel_id: &[u8; 16],
    conn_index: u8,
    options: &ConnectionOptions,
) -> Result<Vec<u8>, CodecError> {
    let mut out = encode_bootstrap()?;
    out.extend_from_slice(&encode_call(auth, tunnel_id, conn_index, options)?);
    Ok(out)
}

/// Bootstrap message.
///
/// `Message` struct: 1 data word (union discriminant at data\[0..2\]) + 1
/// pointer. `Bootstrap` struct: 1 data word (`questionId` u32) + 1 pointer
/// (deprecated object id, null). Question id 0 is implied by the zeroed
/// allocation.
fn encode_bootstrap() -> Result<Vec<u8>, CodecError> {
    let mut b = MessageBuilder::with_capacity(256);

    let root = b.alloc(1)?;
    let msg = b.alloc(1 + 1)?;
    b.write_struct_ptr(root, msg, 1, 1);
    b.put_u16(msg, MSG_BOOTSTRAP);

    let boot = b.alloc(1 + 1)?;
    b.write_struct_ptr(msg + 8, boot, 1, 1);

    Ok(b.finalize())
}

/// Call message invoking `registerConnection`.
///
/// `Call` struct (3 data words, 3 pointers):
/// - data: `questionId` u32 at 0, `methodId` u16 at 4, `sendResultsTo`
///   discriminant u16 at 6 (0 = caller), `interfaceId` u64 at 8;
/// - pointers: target (`MessageTarget`), params (`Payload`), null.
///
/// The target is a `promisedAnswer` whose `PromisedAnswer.questionId`
/// references the Bootstrap question and whose transform list is empty.
fn encode_call(
    auth: &TunnelAuth,
    tunnel_id: &[u8; 16],
    conn_index: u8,
    options: &ConnectionOptions,
) -> Result<Vec<u8>, CodecError> {
    let mut b = MessageBuilder::with_capacity(4096);

    let root = b.alloc(1)?;
    let msg = b.alloc(1 + 1)?;
    b.write_struct_ptr(root, msg, 1, 1);
    b.put_u16(msg, MSG_CALL);

    let call = b.alloc(3 + 3)?;
    b.write_struct_ptr(msg + 8, call, 3, 3);
    b.put_u32(call, 1); // questionId
    b.put_u16(call + 4, REGISTER_CONNECTION_METHOD_ID);
    b.put_u64(call + 8, TUNNEL_SERVER_INTERFACE_ID);
    let call_ptrs = call + 3 * 8;

    // target: MessageTarget (1 data word, 1 pointer), which = promisedAnswer
    let target = b.alloc(1 + 1)?;
    b.write_struct_ptr(call_ptrs, target, 1, 1);
    b.put_u16(target + 4, TARGET_PROMISED_ANSWER);

    // PromisedAnswer: questionId 0 (the Bootstrap), empty transform
    let answer = b.alloc(1 + 1)?;
    b.write_struct_ptr(target + 8, answer, 1, 1);

    // params: Payload (0 data words, 2 pointers); capTable stays null
    let payload = b.alloc(2)?;
    b.write_struct_ptr(call_ptrs + 8, payload, 0, 2);

    // Payload.content: registration params (1 data word, 3 pointers)
    let params = b.alloc(1 + 3)?;
    b.write_struct_ptr(payload, params, 1, 3);
    b.put_u8(params, conn_index);
    let params_ptrs = params + 8;

    // TunnelAuth: accountTag text + tunnelSecret data
    let tunnel_auth = b.alloc(2)?;
    b.write_struct_ptr(params_ptrs, tunnel_auth, 0, 2);
    b.write_text(tunnel_auth, &auth.account_tag)?;
    b.write_data(tunnel_auth + 8, &auth.tunnel_secret)?;

    // tunnelId: 16-byte data
    b.write_data(params_ptrs + 8, tunnel_id)?;

    // ConnectionOptions (1 data word, 2 pointers)
    let conn_opts = b.alloc(1 + 2)?;
    b.write_struct_ptr(params_ptrs + 16, conn_opts, 1, 2);
    if options.replace_existing {
        b.set_bit(conn_opts, 0);
    }
    b.put_u8(conn_opts + 1, options.compression_quality);
    b.put_u8(conn_opts + 2, options.num_previous_attempts);

    // ClientInfo (0 data words, 4 pointers): clientId data, null feature
    // list, version text, arch text. originLocalIp stays null.
    let client_info = b.alloc(4)?;
    b.write_struct_ptr(conn_opts + 8, client_info, 0, 4);
    b.write_data(client_info, &options.client_id)?;
    b.write_text(client_info + 16, &options.version)?;
    b.write_text(client_info + 24, &options.arch)?;

    Ok(b.finalize())
}

/// Decode a control-stream message as a registration Return.
///
/// Returns `Ok` with the registration outcome (success or an explicit
/// registration error) when the message is a decodable Return, and `Err`
/// for anything else, including the Return for the Bootstrap question,
/// whose payload is a capability pointer rather than a struct.
pub fn decode_response(bytes: &[u8]) -> Result<RegistrationResult, RpcError> {
    let reader = MessageReader::new(bytes)?;
    let root = reader.struct_ptr(0)?;

    let msg_which = reader.u16_at(root.offset, 0);
    if msg_which != MSG_RETURN {
        return Err(RpcError::UnexpectedMessage(msg_which));
    }

    let ret = reader.struct_ptr(root.ptr(0))?;
    let answer_id = reader.u32_at(ret.offset, 0);
    let ret_which = reader.u16_at(ret.offset, 6);
    debug!(answer_id, discriminant = ret_which, "decoding Return");

    let mut result = RegistrationResult::default();

    match ret_which {
        RETURN_EXCEPTION => {
            if let Ok(exception) = reader.struct_ptr(ret.ptr(0)) {
                if exception.ptr_words >= 1 {
                    let reason = reader.text(exception.ptr(0))?;
                    result.error = String::from_utf8_lossy(reason).into_owned();
                }
            }
            result.should_retry = true;
            Ok(result)
        }
        RETURN_CANCELED => {
            result.error = "registration canceled".to_string();
            Ok(result)
        }
        RETURN_RESULTS => {
            let payload = reader.struct_ptr(ret.ptr(0))?;
            // Payload.content is a single-pointer results wrapper
            // (the generated `registerConnection` results type) whose sole
            // pointer is the ConnectionResponse.
            let wrapper = reader.struct_ptr(payload.ptr(0))?;
            if wrapper.ptr_words < 1 {
                return Err(RpcError::MissingPayload);
            }
            let response = reader.struct_ptr(wrapper.ptr(0))?;
            decode_connection_response(&reader, response, &mut result)?;
            Ok(result)
        }
        other => Err(RpcError::UnknownReturn(other)),
    }
}

fn decode_connection_response(
    reader: &MessageReader<'_>,
    response: crate::codec::StructPtr,
    result: &mut RegistrationResult,
) -> Result<(), RpcError> {
    let which = reader.u16_at(response.offset, 0);
    match which {
        RESPONSE_ERROR => {
            // ConnectionError (2 data words, 1 pointer): retryAfter i64 at
            // data 0, shouldRetry bit at byte 8, cause text at pointer 0.
            match reader.struct_ptr(response.ptr(0)) {
                Ok(err) => {
                    result.retry_after_ns = reader.u64_at(err.offset, 0) as i64;
                    if err.data_words >= 2 {
                        result.should_retry = reader.bool_at(err.offset, 8, 0);
                    }
                    if err.ptr_words >= 1 {
                        let cause = reader.text(err.ptr(0))?;
                        result.error = String::from_utf8_lossy(cause).into_owned();
                    }
                }
                Err(_) => {
                    result.error = "registration error (could not parse details)".to_string();
                }
            }
            Ok(())
        }
        RESPONSE_CONNECTION_DETAILS => {
            // ConnectionDetails (1 data word, 2 pointers): remotely-managed
            // bit, 16-byte connection UUID, location name.
            let details = reader.struct_ptr(response.ptr(0))?;
            result.tunnel_is_remote = reader.bool_at(details.offset, 0, 0);
            if details.ptr_words >= 1 {
                let uuid = reader.data(details.ptr(0))?;
                result.uuid = format_uuid(uuid);
            }
            if details.ptr_words >= 2 {
                let location = reader.text(details.ptr(1))?;
                result.location = String::from_utf8_lossy(location).into_owned();
            }
            result.success = true;
            Ok(())
        }
        other => Err(RpcError::UnknownResponse(other)),
    }
}

/// Canonical hyphenated form for 16-byte UUIDs; a plain hex dump for
/// anything of unexpected length.
fn format_uuid(bytes: &[u8]) -> String {
    match <[u8; 16]>::try_from(bytes) {
        Ok(raw) => Uuid::from_bytes(raw).hyphenated().to_string(),
        Err(_) => bytes.iter().map(|b| format!("{b:02x}")).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::wire_message_size;

    fn test_auth() -> TunnelAuth {
        TunnelAuth {
            account_tag: "a1b2c3".to_string(),
            tunnel_secret: vec![0xAA; 32],
        }
    }

    fn test_options() -> ConnectionOptions {
        ConnectionOptions {
            client_id: [7; 16],
            version: "argotun/0.1.0".to_string(),
            arch: "linux_x86_64".to_string(),
            replace_existing: true,
            compression_quality: 0,
            num_previous_attempts: 2,
        }
    }

    /// Build a Return whose results hold a successful ConnectionDetails.
    fn build_return_success(uuid: &[u8; 16], location: &str) -> Vec<u8> {
        let mut b = MessageBuilder::with_capacity(1024);
        let root = b.alloc(1).unwrap();
        let msg = b.alloc(2).unwrap();
        b.write_struct_ptr(root, msg, 1, 1);
        b.put_u16(msg, MSG_RETURN);

        let ret = b.alloc(3).unwrap();
        b.write_struct_ptr(msg + 8, ret, 2, 1);
        b.put_u32(ret, 1); // answerId
        b.put_u16(ret + 6, RETURN_RESULTS);

        let payload = b.alloc(2).unwrap();
        b.write_struct_ptr(ret + 16, payload, 0, 2);

        let wrapper = b.alloc(1).unwrap();
        b.write_struct_ptr(payload, wrapper, 0, 1);

        let response = b.alloc(2).unwrap();
        b.write_struct_ptr(wrapper, response, 1, 1);
        b.put_u16(response, RESPONSE_CONNECTION_DETAILS);

        let details = b.alloc(3).unwrap();
        b.write_struct_ptr(response + 8, details, 1, 2);
        b.set_bit(details, 0); // remotely managed
        b.write_data(details + 8, uuid).unwrap();
        b.write_text(details + 16, location).unwrap();

        b.finalize()
    }

    /// Build a Return whose union is an exception with the given reason.
    fn build_return_exception(reason: &str) -> Vec<u8> {
        let mut b = MessageBuilder::with_capacity(512);
        let root = b.alloc(1).unwrap();
        let msg = b.alloc(2).unwrap();
        b.write_struct_ptr(root, msg, 1, 1);
        b.put_u16(msg, MSG_RETURN);

        let ret = b.alloc(3).unwrap();
        b.write_struct_ptr(msg + 8, ret, 2, 1);
        b.put_u32(ret, 1);
        b.put_u16(ret + 6, RETURN_EXCEPTION);

        let exception = b.alloc(2).unwrap();
        b.write_struct_ptr(ret + 16, exception, 1, 1);
        b.write_text(exception + 8, reason).unwrap();

        b.finalize()
    }

    #[test]
    fn register_is_two_framed_messages() {
        let blob = encode_register(&test_auth(), &[9; 16], 0, &test_options()).unwrap();

        let first = wire_message_size(&blob);
        assert!(first > 0);
        let second = wire_message_size(&blob[first..]);
        assert!(second > 0);
        assert_eq!(first + second, blob.len());
    }

    #[test]
    fn bootstrap_shape() {
        let blob = encode_register(&test_auth(), &[9; 16], 0, &test_options()).unwrap();
        let first = wire_message_size(&blob);

        let r = MessageReader::new(&blob[..first]).unwrap();
        let root = r.struct_ptr(0).unwrap();
        assert_eq!(r.u16_at(root.offset, 0), MSG_BOOTSTRAP);

        let boot = r.struct_ptr(root.ptr(0)).unwrap();
        assert_eq!(r.u32_at(boot.offset, 0), 0, "questionId");
    }

    #[test]
    fn call_shape_and_pipelined_target() {
        let auth = test_auth();
        let options = test_options();
        let tunnel_id = [0xC4; 16];
        let blob = encode_register(&auth, &tunnel_id, 3, &options).unwrap();
        let first = wire_message_size(&blob);

        let r = MessageReader::new(&blob[first..]).unwrap();
        let root = r.struct_ptr(0).unwrap();
        assert_eq!(r.u16_at(root.offset, 0), MSG_CALL);

        let call = r.struct_ptr(root.ptr(0)).unwrap();
        assert_eq!(r.u32_at(call.offset, 0), 1, "questionId");
        assert_eq!(r.u16_at(call.offset, 4), REGISTER_CONNECTION_METHOD_ID);
        assert_eq!(r.u16_at(call.offset, 6), 0, "sendResultsTo = caller");
        assert_eq!(r.u64_at(call.offset, 8), TUNNEL_SERVER_INTERFACE_ID);

        let target = r.struct_ptr(call.ptr(0)).unwrap();
        assert_eq!(r.u16_at(target.offset, 4), TARGET_PROMISED_ANSWER);
        let answer = r.struct_ptr(target.ptr(0)).unwrap();
        assert_eq!(r.u32_at(answer.offset, 0), 0, "references the Bootstrap");

        let payload = r.struct_ptr(call.ptr(1)).unwrap();
        let params = r.struct_ptr(payload.ptr(0)).unwrap();
        assert_eq!(r.u8_at(params.offset, 0), 3, "connIndex");

        let tunnel_auth = r.struct_ptr(params.ptr(0)).unwrap();
        assert_eq!(r.text(tunnel_auth.ptr(0)).unwrap(), auth.account_tag.as_bytes());
        assert_eq!(r.data(tunnel_auth.ptr(1)).unwrap(), &auth.tunnel_secret[..]);

        assert_eq!(r.data(params.ptr(1)).unwrap(), &tunnel_id);

        let conn_opts = r.struct_ptr(params.ptr(2)).unwrap();
        assert!(r.bool_at(conn_opts.offset, 0, 0), "replaceExisting");
        assert_eq!(r.u8_at(conn_opts.offset, 2), 2, "numPreviousAttempts");

        let client_info = r.struct_ptr(conn_opts.ptr(0)).unwrap();
        assert_eq!(r.data(client_info.ptr(0)).unwrap(), &options.client_id);
        assert_eq!(r.text(client_info.ptr(2)).unwrap(), options.version.as_bytes());
        assert_eq!(r.text(client_info.ptr(3)).unwrap(), options.arch.as_bytes());
    }

    #[test]
    fn decode_success() {
        let uuid: [u8; 16] = [
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD,
            0xEE, 0xFF,
        ];
        let msg = build_return_success(&uuid, "SJC");

        let result = decode_response(&msg).unwrap();
        assert!(result.success);
        assert_eq!(result.uuid, "00112233-4455-6677-8899-aabbccddeeff");
        assert_eq!(result.location, "SJC");
        assert!(result.tunnel_is_remote);
        assert!(result.error.is_empty());
    }

    #[test]
    fn decode_exception() {
        let msg = build_return_exception("unauthorized");

        let result = decode_response(&msg).unwrap();
        assert!(!result.success);
        assert_eq!(result.error, "unauthorized");
        assert!(result.should_retry);
    }

    #[test]
    fn decode_connection_error() {
        let mut b = MessageBuilder::with_capacity(512);
        let root = b.alloc(1).unwrap();
        let msg = b.alloc(2).unwrap();
        b.write_struct_ptr(root, msg, 1, 1);
        b.put_u16(msg, MSG_RETURN);
        let ret = b.alloc(3).unwrap();
        b.write_struct_ptr(msg + 8, ret, 2, 1);
        b.put_u32(ret, 1);
        b.put_u16(ret + 6, RETURN_RESULTS);
        let payload = b.alloc(2).unwrap();
        b.write_struct_ptr(ret + 16, payload, 0, 2);
        let wrapper = b.alloc(1).unwrap();
        b.write_struct_ptr(payload, wrapper, 0, 1);
        let response = b.alloc(2).unwrap();
        b.write_struct_ptr(wrapper, response, 1, 1);
        b.put_u16(response, RESPONSE_ERROR);
        let err = b.alloc(3).unwrap();
        b.write_struct_ptr(response + 8, err, 2, 1);
        b.put_u64(err, 5_000_000_000);
        b.set_bit(err + 8, 0);
        b.write_text(err + 16, "conn limit reached").unwrap();

        let result = decode_response(&b.finalize()).unwrap();
        assert!(!result.success);
        assert_eq!(result.error, "conn limit reached");
        assert_eq!(result.retry_after_ns, 5_000_000_000);
        assert!(result.should_retry);
    }

    #[test]
    fn non_return_message_is_rejected() {
        let mut b = MessageBuilder::with_capacity(128);
        let root = b.alloc(1).unwrap();
        let msg = b.alloc(2).unwrap();
        b.write_struct_ptr(root, msg, 1, 1);
        b.put_u16(msg, MSG_BOOTSTRAP);

        assert!(matches!(
            decode_response(&b.finalize()),
            Err(RpcError::UnexpectedMessage(MSG_BOOTSTRAP))
        ));
    }

    #[test]
    fn decode_canceled() {
        let mut b = MessageBuilder::with_capacity(128);
        let root = b.alloc(1).unwrap();
        let msg = b.alloc(2).unwrap();
        b.write_struct_ptr(root, msg, 1, 1);
        b.put_u16(msg, MSG_RETURN);
        let ret = b.alloc(3).unwrap();
        b.write_struct_ptr(msg + 8, ret, 2, 1);
        b.put_u16(ret + 6, RETURN_CANCELED);

        let result = decode_response(&b.finalize()).unwrap();
        assert!(!result.success);
        assert_eq!(result.error, "registration canceled");
    }
}
