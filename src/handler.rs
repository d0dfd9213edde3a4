//! Handler request encoding and the per-handler worker task.
//!
//! Requests bound for an out-of-process handler are framed as
//! `<uuid> <conn-id> <path> <payload>`. The payload encoding depends on the
//! handler's protocol: a tagged-netstring headers dict emitted with the
//! streaming helpers, or a JSON headers object wrapped in a plain
//! netstring. Either way the frame is built in one reversed pass with no
//! intermediate buffers.
//!
//! Each running handler gets one worker task that drains the handler's
//! outbox. Stopping is cooperative: the stop sweep clears `running` and
//! pings the shutdown notifier; the worker re-checks the flag at its next
//! wakeup and returns, parking the outbox receiver back into the handler so
//! a later start pass can respawn it.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::backend::{Handler, HandlerProtocol};
use crate::tnetstring::{self, OutBuf};

/// Encode a complete handler-bound request frame.
///
/// Multi-valued headers become a nested list under the tnet protocol and a
/// JSON array under the json protocol.
pub fn encode_request(
    protocol: HandlerProtocol,
    uuid: &str,
    conn_id: u64,
    path: &str,
    headers: &HashMap<String, Vec<String>>,
) -> Vec<u8> {
    let mut out = OutBuf::new();
    let start = match protocol {
        HandlerProtocol::Tnet => {
            let start = tnetstring::request_start(&mut out);
            for (key, values) in headers {
                match values.as_slice() {
                    [] => {}
                    [value] => tnetstring::header_pair(&mut out, key.as_bytes(), value.as_bytes()),
                    values => tnetstring::header_pair_list(&mut out, key.as_bytes(), values),
                }
            }
            start
        }
        HandlerProtocol::Json => {
            let json = json_headers(headers).to_string();
            out.put(b',');
            let start = out.len();
            out.put_reversed(json.as_bytes());
            start
        }
    };
    tnetstring::request_end(&mut out, start, uuid, conn_id, path);
    out.finish()
}

fn json_headers(headers: &HashMap<String, Vec<String>>) -> serde_json::Value {
    let object = headers
        .iter()
        .filter(|(_, values)| !values.is_empty())
        .map(|(key, values)| {
            let value = match values.as_slice() {
                [value] => serde_json::Value::String(value.clone()),
                values => values.iter().cloned().map(serde_json::Value::String).collect(),
            };
            (key.clone(), value)
        })
        .collect();
    serde_json::Value::Object(object)
}

/// Spawn the worker task for a handler. The caller marks the handler
/// running first so the worker never races its own start.
pub(crate) fn spawn_worker(handler: Arc<Handler>) {
    tokio::spawn(run_worker(handler));
}

async fn run_worker(handler: Arc<Handler>) {
    let Some(mut inbox) = handler.inbox.lock().take() else {
        debug!(send_spec = %handler.send_spec, "handler worker already owns the outbox");
        return;
    };
    debug!(send_spec = %handler.send_spec, "handler worker up");
    loop {
        tokio::select! {
            _ = handler.shutdown.notified() => {}
            frame = inbox.recv() => match frame {
                Some(frame) => {
                    // The messaging transport attaches here; the frame is
                    // complete wire bytes.
                    trace!(
                        send_spec = %handler.send_spec,
                        bytes = frame.len(),
                        "frame ready for transport"
                    );
                }
                None => break,
            }
        }
        if !handler.is_running() {
            break;
        }
    }
    *handler.inbox.lock() = Some(inbox);
    debug!(send_spec = %handler.send_spec, "handler worker down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::registry::Registry;
    use crate::tnetstring::Value;
    use std::time::Duration;

    const UUID: &str = "54c6755b-9628-40a4-9a2d-cc82a816345e";

    fn headers(pairs: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
            .collect()
    }

    fn split_frame(frame: &[u8]) -> (String, String, String, Vec<u8>) {
        let text = frame.to_vec();
        let mut parts = Vec::new();
        let mut rest = text.as_slice();
        for _ in 0..3 {
            let space = rest.iter().position(|&b| b == b' ').unwrap();
            parts.push(String::from_utf8(rest[..space].to_vec()).unwrap());
            rest = &rest[space + 1..];
        }
        (
            parts[0].clone(),
            parts[1].clone(),
            parts[2].clone(),
            rest.to_vec(),
        )
    }

    #[test]
    fn test_encode_request_tnet() {
        let headers = headers(&[("Host", &["d.example"]), ("Accept", &["text/html", "*/*"])]);
        let frame = encode_request(HandlerProtocol::Tnet, UUID, 7, "/users", &headers);

        let (uuid, conn_id, path, payload) = split_frame(&frame);
        assert_eq!(uuid, UUID);
        assert_eq!(conn_id, "7");
        assert_eq!(path, "/users");

        let (value, rest) = tnetstring::parse(&payload).unwrap();
        assert!(rest.is_empty());
        let Value::Dict(dict) = value else {
            panic!("expected headers dict");
        };
        assert_eq!(dict.get(b"Host".as_slice()), Some(&Value::str("d.example")));
        assert_eq!(
            dict.get(b"Accept".as_slice()),
            Some(&Value::List(vec![
                Value::str("text/html"),
                Value::str("*/*"),
            ]))
        );
    }

    #[test]
    fn test_encode_request_json() {
        let headers = headers(&[("Host", &["d.example"]), ("Accept", &["text/html", "*/*"])]);
        let frame = encode_request(HandlerProtocol::Json, UUID, 7, "/users", &headers);

        let (uuid, conn_id, path, payload) = split_frame(&frame);
        assert_eq!(uuid, UUID);
        assert_eq!(conn_id, "7");
        assert_eq!(path, "/users");

        // The payload is a single netstring wrapping a JSON object.
        let (value, rest) = tnetstring::parse(&payload).unwrap();
        assert!(rest.is_empty());
        let Value::String(json) = value else {
            panic!("expected a string payload");
        };
        let parsed: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed["Host"], "d.example");
        assert_eq!(parsed["Accept"], serde_json::json!(["text/html", "*/*"]));
    }

    #[test]
    fn test_encode_request_empty_headers() {
        let frame = encode_request(HandlerProtocol::Tnet, "UUID", 0, "/", &HashMap::new());
        assert_eq!(frame, b"UUID 0 / 0:}");
    }

    #[tokio::test]
    async fn test_worker_lifecycle() {
        let registry = Registry::new();
        let entry = registry
            .insert(
                "handler:1:tcp://127.0.0.1:9997:X:tcp://127.0.0.1:9996:X:".to_string(),
                Backend::Handler(crate::backend::Handler::new(
                    "tcp://127.0.0.1:9997",
                    "X",
                    "tcp://127.0.0.1:9996",
                    "X",
                    true,
                    HandlerProtocol::Tnet,
                )),
            )
            .unwrap();
        entry.set_active(true);
        let handler = entry.backend().as_handler().unwrap().clone();

        registry.start_handlers();
        assert!(handler.is_running());
        assert!(handler.deliver(b"frame".to_vec()));

        registry.stop_all();
        assert!(!handler.is_running());

        // The worker parks the receiver back when it observes the stop.
        let mut parked = false;
        for _ in 0..100 {
            if handler.inbox.lock().is_some() {
                parked = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(parked, "worker never released the outbox receiver");
    }
}
