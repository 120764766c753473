//! Two-phase `tools/call` dispatch.
//!
//! Phase A tries every candidate through the `tools/call` envelope. Only when the upstream says
//! the envelope itself is unsupported does phase B retry the candidates as direct JSON-RPC
//! methods.

use super::upstream::{CallAttempt, RpcTransport};
use rmcp::model::ErrorCode;
use serde_json::{Value, json};

/// Calling convention for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallMode {
    /// `method: "tools/call"`, `params: {name, arguments}`.
    Wrapped,
    /// `method: <tool>`, `params: <arguments>`.
    Direct,
    /// `method: <tool>`, `params: {arguments}`.
    DirectWrapped,
}

impl CallMode {
    fn payload(self, id: &Value, tool: &str, arguments: &Value) -> Value {
        match self {
            Self::Wrapped => json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": "tools/call",
                "params": { "name": tool, "arguments": arguments }
            }),
            Self::Direct => json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": tool,
                "params": arguments
            }),
            Self::DirectWrapped => json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": tool,
                "params": { "arguments": arguments }
            }),
        }
    }
}

pub(crate) struct DispatchRequest<'a> {
    pub candidates: &'a [String],
    pub arguments: &'a Value,
    pub rpc_id: &'a Value,
    pub session_id: Option<String>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum DispatchOutcome {
    /// Forward this envelope to the caller.
    Respond {
        envelope: Value,
        session_id: Option<String>,
    },
    /// Nothing decisive; the caller should fall through to the generic proxy.
    Exhausted { last_error: String },
}

fn error_message(envelope: &Value) -> Option<String> {
    let err = envelope.get("error")?;
    Some(
        err.get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase(),
    )
}

/// Numeric error code; numeric strings count.
fn error_code(envelope: &Value) -> Option<i64> {
    match envelope.pointer("/error/code")? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn is_bare_method_not_found(msg: &str, code: Option<i64>) -> bool {
    msg.is_empty() && code == Some(i64::from(ErrorCode::METHOD_NOT_FOUND.0))
}

/// The upstream rejects the `tools/call` envelope as a whole.
fn wrapped_calls_unsupported(msg: &str, code: Option<i64>) -> bool {
    msg.contains("tools not supported")
        || (msg.contains("method") && msg.contains("not found") && !msg.contains("tool not found"))
        || is_bare_method_not_found(msg, code)
}

/// The direct method name does not exist upstream.
fn direct_method_missing(msg: &str, code: Option<i64>) -> bool {
    msg.contains("tool not found")
        || (msg.contains("method") && msg.contains("not found"))
        || is_bare_method_not_found(msg, code)
}

struct Dispatcher<'a, T: ?Sized> {
    transport: &'a T,
    request: DispatchRequest<'a>,
    last_error: String,
}

impl<T: RpcTransport + ?Sized> Dispatcher<'_, T> {
    /// Send one attempt; `None` on transport failure or an unparsable body.
    async fn attempt(&mut self, tool: &str, mode: CallMode) -> Option<Value> {
        let payload = mode.payload(self.request.rpc_id, tool, self.request.arguments);
        let session = self.request.session_id.as_deref();
        let result = self.transport.post(&payload, session).await;
        let attempt: CallAttempt = match result {
            Ok(a) => a,
            Err(e) => {
                tracing::debug!(tool, ?mode, error = %e, "bridge attempt transport failed");
                self.last_error = e.to_string();
                return None;
            }
        };

        if self.request.session_id.is_none()
            && let Some(sid) = attempt.session_id()
        {
            self.request.session_id = Some(sid);
        }

        if attempt.envelope.is_none() {
            tracing::debug!(tool, ?mode, "bridge attempt returned a non-JSON-RPC body");
        }
        self.last_error = attempt.text;
        attempt.envelope
    }

    fn respond(&self, envelope: Value) -> DispatchOutcome {
        DispatchOutcome::Respond {
            envelope,
            session_id: self.request.session_id.clone(),
        }
    }

    /// Phase A. `Err(())` means the wrapped convention is unsupported upstream.
    async fn wrapped_phase(&mut self) -> Result<Option<DispatchOutcome>, ()> {
        let candidates = self.request.candidates;
        for tool in candidates {
            let Some(envelope) = self.attempt(tool, CallMode::Wrapped).await else {
                continue;
            };
            let Some(msg) = error_message(&envelope) else {
                tracing::debug!(tool = %tool, "bridge call succeeded (tools/call)");
                return Ok(Some(self.respond(envelope)));
            };
            let code = error_code(&envelope);
            if wrapped_calls_unsupported(&msg, code) {
                tracing::debug!(tool = %tool, %msg, "upstream does not support tools/call");
                return Err(());
            }
            if msg.contains("tool not found") {
                tracing::debug!(tool = %tool, "tool not found upstream; trying next candidate");
                continue;
            }
            return Ok(Some(self.respond(envelope)));
        }
        Ok(None)
    }

    /// Phase B: every candidate as a direct method.
    async fn direct_phase(&mut self) -> Option<DispatchOutcome> {
        let candidates = self.request.candidates;
        for tool in candidates {
            for mode in [CallMode::Direct, CallMode::DirectWrapped] {
                let Some(envelope) = self.attempt(tool, mode).await else {
                    continue;
                };
                let Some(msg) = error_message(&envelope) else {
                    tracing::debug!(tool = %tool, ?mode, "bridge call succeeded (direct)");
                    return Some(self.respond(envelope));
                };
                let missing = direct_method_missing(&msg, error_code(&envelope));
                if mode == CallMode::Direct && (missing || msg.contains("invalid params")) {
                    continue;
                }
                if missing {
                    break;
                }
                return Some(self.respond(envelope));
            }
        }
        None
    }
}

/// Try every candidate until one yields a decisive answer.
///
/// Success and genuine application errors are both decisive and are forwarded verbatim.
pub(crate) async fn dispatch<T: RpcTransport + ?Sized>(
    transport: &T,
    request: DispatchRequest<'_>,
) -> DispatchOutcome {
    let mut d = Dispatcher {
        transport,
        request,
        last_error: String::new(),
    };

    match d.wrapped_phase().await {
        Ok(Some(outcome)) => return outcome,
        Ok(None) => {}
        Err(()) => {
            if let Some(outcome) = d.direct_phase().await {
                return outcome;
            }
        }
    }

    DispatchOutcome::Exhausted {
        last_error: d.last_error.chars().take(200).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::upstream::testing::ScriptedTransport;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|v| (*v).to_string()).collect()
    }

    fn ok(id: i64, result: Value) -> Value {
        json!({"jsonrpc": "2.0", "id": id, "result": result})
    }

    fn err(code: Value, message: &str) -> Value {
        json!({"jsonrpc": "2.0", "id": 1, "error": {"code": code, "message": message}})
    }

    async fn run(
        transport: &ScriptedTransport,
        candidates: &[String],
        session_id: Option<&str>,
    ) -> DispatchOutcome {
        let args = json!({"prompt": "x"});
        let id = json!(1);
        dispatch(
            transport,
            DispatchRequest {
                candidates,
                arguments: &args,
                rpc_id: &id,
                session_id: session_id.map(str::to_string),
            },
        )
        .await
    }

    fn methods(transport: &ScriptedTransport) -> Vec<String> {
        transport
            .sent()
            .into_iter()
            .map(|(p, _)| match p["method"].as_str() {
                Some("tools/call") => format!("call:{}", p["params"]["name"].as_str().unwrap_or("")),
                Some(m) if p["params"].get("arguments").is_some() => format!("wrapped:{m}"),
                Some(m) => format!("direct:{m}"),
                None => String::new(),
            })
            .collect()
    }

    #[tokio::test]
    async fn tool_not_found_moves_to_next_candidate_and_stops_on_success() {
        let success = ok(1, json!({"request_id": "r1"}));
        let transport = ScriptedTransport::default()
            .reply_json(err(json!(-32602), "Tool not found: a"))
            .reply_json(success.clone());

        let outcome = run(&transport, &names(&["a", "b", "c"]), Some("s")).await;
        assert_eq!(
            outcome,
            DispatchOutcome::Respond {
                envelope: success,
                session_id: Some("s".to_string())
            }
        );
        assert_eq!(methods(&transport), vec!["call:a", "call:b"]);

        let sent = transport.sent();
        assert_eq!(sent[1].0["id"], 1);
        assert_eq!(sent[1].0["params"]["arguments"], json!({"prompt": "x"}));
    }

    #[tokio::test]
    async fn bare_method_not_found_enters_direct_phase_for_all_candidates() {
        let success = ok(1, json!({"ok": true}));
        let transport = ScriptedTransport::default()
            .reply_json(err(json!(-32601), ""))
            .reply_json(err(json!(-32601), "Method not found"))
            .reply_json(success.clone());

        let outcome = run(&transport, &names(&["a", "b"]), None).await;
        assert!(matches!(outcome, DispatchOutcome::Respond { ref envelope, .. } if *envelope == success));
        // Candidate "b" is never tried wrapped; phase B starts over at "a".
        assert_eq!(methods(&transport), vec!["call:a", "direct:a", "wrapped:a"]);
        assert_eq!(
            transport.sent()[2].0["params"],
            json!({"arguments": {"prompt": "x"}})
        );
    }

    #[tokio::test]
    async fn missing_direct_method_still_tries_direct_wrapped_before_next_candidate() {
        let success = ok(1, json!({"ok": true}));
        let transport = ScriptedTransport::default()
            .reply_json(err(json!(-32601), ""))
            .reply_json(err(json!(-32602), "Tool not found: a"))
            .reply_json(err(json!(-32601), "Method not found"))
            .reply_json(success.clone());

        let outcome = run(&transport, &names(&["a", "b"]), None).await;
        assert!(matches!(outcome, DispatchOutcome::Respond { ref envelope, .. } if *envelope == success));
        assert_eq!(
            methods(&transport),
            vec!["call:a", "direct:a", "wrapped:a", "direct:b"]
        );
    }

    #[tokio::test]
    async fn string_error_code_counts_as_method_not_found() {
        let transport = ScriptedTransport::default()
            .reply_json(err(json!("-32601"), ""))
            .reply_json(ok(1, json!({})));
        run(&transport, &names(&["a", "b"]), None).await;
        assert_eq!(methods(&transport), vec!["call:a", "direct:a"]);
    }

    #[tokio::test]
    async fn tools_not_supported_message_enters_direct_phase() {
        let transport = ScriptedTransport::default()
            .reply_json(err(json!(-32000), "Tools not supported by this server"))
            .reply_json(ok(1, json!({})));
        run(&transport, &names(&["a"]), None).await;
        assert_eq!(methods(&transport), vec!["call:a", "direct:a"]);
    }

    #[tokio::test]
    async fn invalid_params_in_direct_mode_retries_direct_wrapped() {
        let success = ok(1, json!({"done": true}));
        let transport = ScriptedTransport::default()
            .reply_json(err(json!(-32601), ""))
            .reply_json(err(json!(-32602), "Invalid params: expected arguments"))
            .reply_json(success.clone());

        let outcome = run(&transport, &names(&["a", "b"]), None).await;
        assert!(matches!(outcome, DispatchOutcome::Respond { ref envelope, .. } if *envelope == success));
        assert_eq!(methods(&transport), vec!["call:a", "direct:a", "wrapped:a"]);
        assert_eq!(
            transport.sent()[2].0["params"],
            json!({"arguments": {"prompt": "x"}})
        );
    }

    #[tokio::test]
    async fn application_error_is_forwarded_without_trying_more_candidates() {
        let app_err = err(json!(-32000), "prompt is required");
        let transport = ScriptedTransport::default().reply_json(app_err.clone());

        let outcome = run(&transport, &names(&["a", "b"]), None).await;
        assert!(matches!(outcome, DispatchOutcome::Respond { ref envelope, .. } if *envelope == app_err));
        assert_eq!(methods(&transport), vec!["call:a"]);
    }

    #[tokio::test]
    async fn direct_phase_forwards_application_errors_and_invalid_params_after_wrapping() {
        let app_err = err(json!(-32602), "invalid params: still wrong");
        let transport = ScriptedTransport::default()
            .reply_json(err(json!(-32601), ""))
            .reply_json(err(json!(-32602), "Invalid params"))
            .reply_json(app_err.clone());

        let outcome = run(&transport, &names(&["a", "b"]), None).await;
        assert!(matches!(outcome, DispatchOutcome::Respond { ref envelope, .. } if *envelope == app_err));
        assert_eq!(methods(&transport), vec!["call:a", "direct:a", "wrapped:a"]);
    }

    #[tokio::test]
    async fn transport_failures_and_garbage_are_skipped() {
        let success = ok(1, json!({}));
        let transport = ScriptedTransport::default()
            .reply_err("connection reset")
            .reply_text("<html>502</html>", &[])
            .reply_json(success.clone());

        let outcome = run(&transport, &names(&["a", "b", "c"]), None).await;
        assert!(matches!(outcome, DispatchOutcome::Respond { ref envelope, .. } if *envelope == success));
        assert_eq!(methods(&transport), vec!["call:a", "call:b", "call:c"]);
    }

    #[tokio::test]
    async fn exhaustion_reports_last_error_for_both_phases() {
        let transport = ScriptedTransport::default()
            .reply_json(err(json!(-32602), "tool not found"))
            .reply_json(err(json!(-32602), "tool not found: b"));
        let outcome = run(&transport, &names(&["a", "b"]), None).await;
        let DispatchOutcome::Exhausted { last_error } = outcome else {
            panic!("expected exhaustion");
        };
        assert!(last_error.contains("tool not found: b"), "{last_error}");

        let transport = ScriptedTransport::default()
            .reply_json(err(json!(-32601), ""))
            .reply_json(err(json!(-32601), "Method not found"))
            .reply_json(err(json!(-32601), "Method not found"))
            .reply_json(err(json!(-32601), "method b not found"))
            .reply_json(err(json!(-32601), "method b not found (wrapped)"));
        let outcome = run(&transport, &names(&["a", "b"]), None).await;
        let DispatchOutcome::Exhausted { last_error } = outcome else {
            panic!("expected exhaustion");
        };
        assert!(last_error.contains("(wrapped)"), "{last_error}");
        assert_eq!(
            methods(&transport),
            vec!["call:a", "direct:a", "wrapped:a", "direct:b", "wrapped:b"]
        );
    }

    #[tokio::test]
    async fn session_id_from_response_headers_is_adopted_for_later_calls() {
        let transport = ScriptedTransport::default()
            .reply_text(
                r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32602,"message":"tool not found"}}"#,
                &[("x-mcp-session-id", "late")],
            )
            .reply_json(ok(1, json!({})));

        let outcome = run(&transport, &names(&["a", "b"]), None).await;
        let DispatchOutcome::Respond { session_id, .. } = outcome else {
            panic!("expected response");
        };
        assert_eq!(session_id.as_deref(), Some("late"));

        let sent = transport.sent();
        assert_eq!(sent[0].1, None);
        assert_eq!(sent[1].1.as_deref(), Some("late"));
    }
}
