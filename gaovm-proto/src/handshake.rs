//! The `hello` exchange: protocol version check, authentication, and
//! capability negotiation.
//!
//! Every new channel performs a bidirectional `hello` before any other
//! method is served. The initiator sends `hello` as a request; the receiver
//! validates protocol (−32010), auth token (−32011, driver↔daemon channels
//! only), and capabilities (−32012), then replies with the computed
//! intersection. Only after both directions have been accepted is either
//! side authenticated.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::channel::{InboundRequest, RpcChannel};
use crate::error::ProtoError;
use crate::message::{
    RpcErrorObject, ERR_AUTH_FAILED, ERR_CAPABILITY_MISMATCH, ERR_HANDSHAKE_FAILED,
};

/// Exact protocol version string; any mismatch fails the handshake.
pub const PROTOCOL_VERSION: &str = "gaovm.v1.2";

/// Deadline for each side of the `hello` exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Parameters of a `hello` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloParams {
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

/// Result of an accepted `hello`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloReply {
    pub protocol: String,
    pub capabilities: Vec<String>,
    pub accepted_capabilities: Vec<String>,
}

/// Per-channel handshake parameters.
#[derive(Debug, Clone, Default)]
pub struct HandshakeConfig {
    /// Methods this side is willing to serve.
    pub capabilities: Vec<String>,
    /// Methods this side demands from the peer.
    pub required: Vec<String>,
    /// Token presented in our outbound `hello` (driver↔daemon only).
    pub auth_token: Option<String>,
    /// Token demanded from the peer's `hello` (driver↔daemon only).
    pub expected_token: Option<String>,
}

/// Compute the accepted capability set.
///
/// The intersection of the peer's offered capabilities with our supported
/// set must cover everything the peer requires.
///
/// # Errors
/// Returns a −32012 error naming the uncovered capabilities.
pub fn negotiate(
    offered: &[String],
    supported: &[String],
    required: &[String],
) -> Result<Vec<String>, RpcErrorObject> {
    let accepted: Vec<String> = offered
        .iter()
        .filter(|c| supported.contains(c))
        .cloned()
        .collect();
    let missing: Vec<&String> = required.iter().filter(|c| !accepted.contains(c)).collect();
    if missing.is_empty() {
        Ok(accepted)
    } else {
        Err(RpcErrorObject::with_data(
            ERR_CAPABILITY_MISMATCH,
            format!(
                "required capabilities not supported: {}",
                missing
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            json!({"required": required, "accepted": accepted}),
        ))
    }
}

/// Validate an inbound `hello` and build the reply.
///
/// Validation order: protocol, token, capabilities — so a peer speaking the
/// wrong protocol is never told whether its token was right.
///
/// # Errors
/// −32010 on protocol mismatch, −32011 on token mismatch, −32012 on an
/// uncoverable capability requirement.
pub fn validate_hello(
    params: &HelloParams,
    supported: &[String],
    expected_token: Option<&str>,
) -> Result<HelloReply, RpcErrorObject> {
    if params.protocol != PROTOCOL_VERSION {
        return Err(RpcErrorObject::with_data(
            ERR_HANDSHAKE_FAILED,
            format!(
                "protocol mismatch: expected {PROTOCOL_VERSION}, got {}",
                params.protocol
            ),
            json!({"expected": PROTOCOL_VERSION, "got": params.protocol}),
        ));
    }
    if let Some(expected) = expected_token {
        if params.auth_token.as_deref() != Some(expected) {
            return Err(RpcErrorObject::new(ERR_AUTH_FAILED, "auth token mismatch"));
        }
    }
    let accepted = negotiate(
        &params.capabilities,
        supported,
        &params.required_capabilities,
    )?;
    Ok(HelloReply {
        protocol: PROTOCOL_VERSION.to_owned(),
        capabilities: supported.to_vec(),
        accepted_capabilities: accepted,
    })
}

/// Validate the reply to our own `hello`.
///
/// # Errors
/// −32010 on protocol mismatch, −32012 if the peer did not accept every
/// capability we require.
pub fn validate_reply(reply: &HelloReply, required: &[String]) -> Result<(), RpcErrorObject> {
    if reply.protocol != PROTOCOL_VERSION {
        return Err(RpcErrorObject::new(
            ERR_HANDSHAKE_FAILED,
            format!(
                "protocol mismatch in reply: expected {PROTOCOL_VERSION}, got {}",
                reply.protocol
            ),
        ));
    }
    let missing: Vec<&String> = required
        .iter()
        .filter(|c| !reply.accepted_capabilities.contains(c))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(RpcErrorObject::new(
            ERR_CAPABILITY_MISMATCH,
            format!(
                "peer did not accept required capabilities: {}",
                missing
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        ))
    }
}

/// Send our `hello` and validate the reply.
///
/// # Errors
/// [`ProtoError::Handshake`] on rejection, [`ProtoError::Timeout`] if the
/// peer does not answer within [`HANDSHAKE_TIMEOUT`].
pub async fn initiate(
    channel: &RpcChannel,
    config: &HandshakeConfig,
) -> Result<HelloReply, ProtoError> {
    let params = HelloParams {
        protocol: PROTOCOL_VERSION.to_owned(),
        auth_token: config.auth_token.clone(),
        capabilities: config.capabilities.clone(),
        required_capabilities: config.required.clone(),
    };
    let result = channel
        .call_with_timeout("hello", Some(serde_json::to_value(&params)?), HANDSHAKE_TIMEOUT)
        .await?;
    let reply: HelloReply = serde_json::from_value(result)?;
    validate_reply(&reply, &config.required).map_err(|e| ProtoError::Handshake(e.message))?;
    Ok(reply)
}

/// Await the peer's `hello` via an already-registered interceptor, validate
/// it, and send the reply.
///
/// The interceptor must be registered with
/// [`RpcChannel::wait_for_request`] *before* any bytes that could carry the
/// peer's `hello` are read — registering early is what resolves the
/// bidirectional hello race.
///
/// # Errors
/// [`ProtoError::Handshake`] on a rejected or malformed `hello` (the
/// rejection is also sent to the peer), [`ProtoError::Timeout`] if none
/// arrives within [`HANDSHAKE_TIMEOUT`].
pub async fn accept(
    channel: &RpcChannel,
    interceptor: tokio::sync::oneshot::Receiver<InboundRequest>,
    config: &HandshakeConfig,
) -> Result<HelloParams, ProtoError> {
    let request = tokio::time::timeout(HANDSHAKE_TIMEOUT, interceptor)
        .await
        .map_err(|_| ProtoError::Timeout(HANDSHAKE_TIMEOUT))?
        .map_err(|_| ProtoError::ChannelClosed)?;

    let params: HelloParams = match request
        .params
        .clone()
        .ok_or_else(|| RpcErrorObject::invalid_params("hello params are required"))
        .and_then(|p| {
            serde_json::from_value(p)
                .map_err(|e| RpcErrorObject::invalid_params(format!("malformed hello params: {e}")))
        }) {
        Ok(params) => params,
        Err(err) => {
            channel.respond_err(request.id, err.clone()).await?;
            return Err(ProtoError::Handshake(err.message));
        }
    };

    match validate_hello(&params, &config.capabilities, config.expected_token.as_deref()) {
        Ok(reply) => {
            channel
                .respond_ok(request.id, serde_json::to_value(&reply)?)
                .await?;
            Ok(params)
        }
        Err(err) => {
            channel.respond_err(request.id, err.clone()).await?;
            Err(ProtoError::Handshake(err.message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn negotiate_accepts_covered_requirements() {
        let accepted = negotiate(
            &caps(&["hello", "ping", "extra"]),
            &caps(&["hello", "ping"]),
            &caps(&["hello", "ping"]),
        )
        .expect("negotiation must succeed");
        assert_eq!(accepted, caps(&["hello", "ping"]));
    }

    #[test]
    fn negotiate_rejects_uncovered_requirement() {
        let err = negotiate(&caps(&["hello"]), &caps(&["hello", "ping"]), &caps(&["ping"]))
            .expect_err("must reject");
        assert_eq!(err.code, ERR_CAPABILITY_MISMATCH);
        assert!(err.data.is_some(), "capability errors carry structured data");
    }

    #[test]
    fn validate_hello_checks_protocol_first() {
        let params = HelloParams {
            protocol: "gaovm.v0.9".to_owned(),
            auth_token: Some("wrong".to_owned()),
            capabilities: caps(&["hello", "ping"]),
            required_capabilities: caps(&["hello"]),
        };
        let err = validate_hello(&params, &caps(&["hello", "ping"]), Some("secret"))
            .expect_err("must reject");
        assert_eq!(err.code, ERR_HANDSHAKE_FAILED, "protocol is checked before the token");
    }

    #[test]
    fn validate_hello_rejects_bad_token() {
        let params = HelloParams {
            protocol: PROTOCOL_VERSION.to_owned(),
            auth_token: Some("wrong".to_owned()),
            capabilities: caps(&["hello", "ping"]),
            required_capabilities: caps(&["hello"]),
        };
        let err = validate_hello(&params, &caps(&["hello", "ping"]), Some("secret"))
            .expect_err("must reject");
        assert_eq!(err.code, ERR_AUTH_FAILED);
    }

    #[test]
    fn validate_hello_accepts_matching_token() {
        let params = HelloParams {
            protocol: PROTOCOL_VERSION.to_owned(),
            auth_token: Some("secret".to_owned()),
            capabilities: caps(&["hello", "ping"]),
            required_capabilities: caps(&["hello", "ping"]),
        };
        let reply = validate_hello(&params, &caps(&["hello", "ping"]), Some("secret"))
            .expect("must accept");
        assert_eq!(reply.accepted_capabilities, caps(&["hello", "ping"]));
    }

    #[test]
    fn missing_token_fails_when_one_is_expected() {
        let params = HelloParams {
            protocol: PROTOCOL_VERSION.to_owned(),
            auth_token: None,
            capabilities: caps(&["hello", "ping"]),
            required_capabilities: vec![],
        };
        let err = validate_hello(&params, &caps(&["hello", "ping"]), Some("secret"))
            .expect_err("must reject");
        assert_eq!(err.code, ERR_AUTH_FAILED);
    }

    #[test]
    fn hello_params_wire_names_are_camel_case() {
        let params = HelloParams {
            protocol: PROTOCOL_VERSION.to_owned(),
            auth_token: Some("t".to_owned()),
            capabilities: caps(&["hello"]),
            required_capabilities: caps(&["hello"]),
        };
        let value = serde_json::to_value(&params).expect("serialize failed");
        assert!(value.get("authToken").is_some(), "authToken must be camelCase");
        assert!(
            value.get("requiredCapabilities").is_some(),
            "requiredCapabilities must be camelCase"
        );
    }
}
