//! End-to-end tests over the in-memory fabric: handshake, round trips,
//! fragmentation, flow control, and fault injection.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{run_both, Fabric, TestEndpoint};
use fabrpc::{
    DatapathError, MsgBuffer, ReqFuncType, Registry, RpcConfig, SessionState, SmErr, SmEvent,
    MAX_MSG_SIZE, SESSION_REQ_WINDOW,
};

/// A linked pair of hosts with an echo handler (type 1) on host-b.
fn echo_pair(bg_threads: usize, server_config: RpcConfig) -> (TestEndpoint, TestEndpoint) {
    let fabric = Fabric::new();
    let reg_a = Registry::new("host-a", 0);
    let reg_b = Registry::new("host-b", bg_threads);
    Registry::link(&reg_a, &reg_b);

    reg_b
        .register_req_handler(
            1,
            if bg_threads > 0 {
                ReqFuncType::Background
            } else {
                ReqFuncType::Foreground
            },
            |req| {
                let data = req.req_data().to_vec();
                req.respond(&data).unwrap();
            },
        )
        .unwrap();
    // Clients validate the request type against the same table.
    reg_a
        .register_req_handler(1, ReqFuncType::Foreground, |req| {
            let data = req.req_data().to_vec();
            req.respond(&data).unwrap();
        })
        .unwrap();

    let client = TestEndpoint::new(&fabric, &reg_a, 0, RpcConfig::default());
    let server = TestEndpoint::new(&fabric, &reg_b, 7, server_config);
    (client, server)
}

fn connect(client: &TestEndpoint, server: &TestEndpoint) -> u16 {
    let session = client.rpc.create_session("host-b", 7, 0).unwrap();
    run_both(&client.rpc, &server.rpc, 4);
    assert_eq!(
        client.rpc.session_state(session),
        Some(SessionState::Connected)
    );
    session
}

fn fill_msgbuf(m: &mut MsgBuffer, seed: u8) {
    for (i, b) in m.data_mut().iter_mut().enumerate() {
        *b = (i as u8).wrapping_mul(31).wrapping_add(seed);
    }
}

// =============================================================================
// Session management
// =============================================================================

#[test]
fn test_connect_handshake() {
    let (client, server) = echo_pair(0, RpcConfig::default());
    let session = client.rpc.create_session("host-b", 7, 0).unwrap();
    assert_eq!(
        client.rpc.session_state(session),
        Some(SessionState::ConnectInProgress)
    );

    run_both(&client.rpc, &server.rpc, 4);

    assert!(client.has_event(SmEvent::Connected));
    assert!(server.has_event(SmEvent::Connected));
    assert_eq!(client.rpc.num_active_sessions(), 1);
    assert_eq!(server.rpc.num_active_sessions(), 1);
    assert_eq!(
        client.rpc.session_state(session),
        Some(SessionState::Connected)
    );
}

#[test]
fn test_create_session_arg_validation() {
    let (client, _server) = echo_pair(0, RpcConfig::default());

    assert!(client.rpc.create_session("host-b", 7, 99).is_err());
    assert!(client.rpc.create_session("", 7, 0).is_err());
    // Self-connection: same hostname and endpoint id.
    assert!(client.rpc.create_session("host-a", 0, 0).is_err());

    let session = client.rpc.create_session("host-b", 7, 0).unwrap();
    // Duplicate session to the same remote endpoint.
    assert!(client.rpc.create_session("host-b", 7, 0).is_err());
    let _ = session;
}

#[test]
fn test_destroy_session_full_flow() {
    let (client, server) = echo_pair(0, RpcConfig::default());
    let session = connect(&client, &server);

    assert!(client.rpc.destroy_session(session));
    run_both(&client.rpc, &server.rpc, 4);

    assert!(client.has_event(SmEvent::Disconnected));
    assert!(server.has_event(SmEvent::Disconnected));
    assert_eq!(client.rpc.num_active_sessions(), 0);
    assert_eq!(server.rpc.num_active_sessions(), 0);
    assert_eq!(client.rpc.session_state(session), None);

    // Idempotence: destroying a buried session is a no-op returning false.
    assert!(!client.rpc.destroy_session(session));
}

#[test]
fn test_destroy_session_rejected_while_connecting() {
    let fabric = Fabric::new();
    let reg = Registry::new("host-a", 0);
    let client = TestEndpoint::new(&fabric, &reg, 0, RpcConfig::default());

    // No route to host-x: the session stays in ConnectInProgress.
    let session = client.rpc.create_session("host-x", 1, 0).unwrap();
    assert!(!client.rpc.destroy_session(session));
    assert_eq!(
        client.rpc.session_state(session),
        Some(SessionState::ConnectInProgress)
    );
}

#[test]
fn test_connect_retry_cap_expires() {
    let fabric = Fabric::new();
    let reg = Registry::new("host-a", 0);
    let config = RpcConfig::default()
        .with_mgmt_retry_ms(1)
        .with_mgmt_max_retries(3);
    let client = TestEndpoint::new(&fabric, &reg, 0, config);

    let session = client.rpc.create_session("host-x", 1, 0).unwrap();
    for _ in 0..20 {
        client.rpc.run_event_loop_one();
        std::thread::sleep(Duration::from_millis(2));
        if client.has_event(SmEvent::ConnectFailed) {
            break;
        }
    }

    assert!(client.has_event(SmEvent::ConnectFailed));
    // The partial session is buried and its slot nulled.
    assert_eq!(client.rpc.session_state(session), None);
    assert_eq!(client.rpc.num_active_sessions(), 0);

    // Subsequent creates get a fresh session number.
    let next = client.rpc.create_session("host-y", 1, 0).unwrap();
    assert_eq!(next, session + 1);
}

#[test]
fn test_fail_resolve_remote_rinfo_client() {
    let (client, server) = echo_pair(0, RpcConfig::default());
    client.rpc.set_fail_resolve_remote_rinfo_client(true);

    let session = client.rpc.create_session("host-b", 7, 0).unwrap();
    run_both(&client.rpc, &server.rpc, 4);

    assert!(client.has_event(SmEvent::ConnectFailed));
    let failed = client
        .sm_events
        .lock()
        .unwrap()
        .iter()
        .filter(|(s, e, err)| {
            *s == session && *e == SmEvent::ConnectFailed && *err == SmErr::ResolveFailure
        })
        .count();
    assert_eq!(failed, 1);
    assert_eq!(client.rpc.session_state(session), None);
}

// =============================================================================
// Round trips
// =============================================================================

#[test]
fn test_small_rpc_roundtrip() {
    let (client, server) = echo_pair(0, RpcConfig::default());
    let session = connect(&client, &server);

    let mut req = client.rpc.alloc_msg_buffer(64);
    assert!(req.is_valid());
    fill_msgbuf(&mut req, 3);
    let expected = req.data().to_vec();

    let got: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let got_c = got.clone();
    client
        .rpc
        .enqueue_request(
            session,
            1,
            req,
            move |_req_buf, resp, tag| {
                assert_eq!(tag, 0xDEAD);
                *got_c.lock().unwrap() = Some(resp.to_vec());
            },
            0xDEAD,
        )
        .unwrap();

    run_both(&client.rpc, &server.rpc, 4);

    assert_eq!(got.lock().unwrap().as_deref(), Some(expected.as_slice()));
    // Steady state: the client is back at full credits; the server holds
    // one until the slot's next request implicitly returns it.
    assert_eq!(client.rpc.session_credits(session), Some(8));
    assert_eq!(server.rpc.session_credits(0), Some(7));
    assert_eq!(client.rpc.unexp_credits(), 20);
    assert_eq!(server.rpc.unexp_credits(), 20);
}

#[test]
fn test_zero_byte_request() {
    let (client, server) = echo_pair(0, RpcConfig::default());
    let session = connect(&client, &server);

    let req = client.rpc.alloc_msg_buffer(0);
    assert!(req.is_valid());
    assert_eq!(req.num_pkts(), 1);

    let done = Arc::new(Mutex::new(false));
    let done_c = done.clone();
    client
        .rpc
        .enqueue_request(
            session,
            1,
            req,
            move |_req_buf, resp, _tag| {
                assert!(resp.is_empty());
                *done_c.lock().unwrap() = true;
            },
            0,
        )
        .unwrap();

    run_both(&client.rpc, &server.rpc, 4);
    assert!(*done.lock().unwrap());
}

#[test]
fn test_exactly_one_packet_request() {
    let (client, server) = echo_pair(0, RpcConfig::default());
    let session = connect(&client, &server);

    // Exactly MAX_DATA_PER_PKT bytes: one packet, not two.
    let mut req = client.rpc.alloc_msg_buffer(1024);
    assert_eq!(req.num_pkts(), 1);
    fill_msgbuf(&mut req, 9);
    let expected = req.data().to_vec();

    let got: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let got_c = got.clone();
    client
        .rpc
        .enqueue_request(
            session,
            1,
            req,
            move |_req_buf, resp, _| *got_c.lock().unwrap() = Some(resp.to_vec()),
            0,
        )
        .unwrap();

    run_both(&client.rpc, &server.rpc, 4);
    assert_eq!(got.lock().unwrap().as_deref(), Some(expected.as_slice()));
}

#[test]
fn test_large_rpc_roundtrip() {
    let fabric = Fabric::new();
    let reg_a = Registry::new("host-a", 0);
    let reg_b = Registry::new("host-b", 0);
    Registry::link(&reg_a, &reg_b);

    // 8 KiB request, 16 KiB response.
    reg_b
        .register_req_handler(2, ReqFuncType::Foreground, |req| {
            assert_eq!(req.req_data().len(), 8 * 1024);
            let mut resp = vec![0u8; 16 * 1024];
            for (i, b) in resp.iter_mut().enumerate() {
                *b = (i % 251) as u8;
            }
            req.respond(&resp).unwrap();
        })
        .unwrap();
    reg_a
        .register_req_handler(2, ReqFuncType::Foreground, |_req| {})
        .unwrap();

    let client = TestEndpoint::new(&fabric, &reg_a, 0, RpcConfig::default());
    let server = TestEndpoint::new(&fabric, &reg_b, 7, RpcConfig::default());
    let session = connect(&client, &server);

    let mut req = client.rpc.alloc_msg_buffer(8 * 1024);
    assert_eq!(req.num_pkts(), 8);
    fill_msgbuf(&mut req, 17);

    let got: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let got_c = got.clone();
    client
        .rpc
        .enqueue_request(
            session,
            2,
            req,
            move |_req_buf, resp, _| *got_c.lock().unwrap() = Some(resp.to_vec()),
            0,
        )
        .unwrap();

    // Multi-packet messages need several TX iterations (8-deep postlist).
    run_both(&client.rpc, &server.rpc, 16);

    let resp = got.lock().unwrap().take().expect("response reassembled");
    assert_eq!(resp.len(), 16 * 1024);
    for (i, b) in resp.iter().enumerate() {
        assert_eq!(*b, (i % 251) as u8);
    }

    // One credit consumed per direction for each message's first packet,
    // returned by the peer's first packet.
    assert_eq!(client.rpc.session_credits(session), Some(8));
    assert_eq!(server.rpc.session_credits(0), Some(7));
    // The server's unexpected window fully recovers once the response ships.
    assert_eq!(server.rpc.unexp_credits(), 20);
}

#[test]
fn test_max_message_size_request() {
    let fabric = Fabric::new();
    let reg_a = Registry::new("host-a", 0);
    let reg_b = Registry::new("host-b", 0);
    Registry::link(&reg_a, &reg_b);

    // The handler answers with the byte it finds at the end of the
    // request, plus the length, so the reply stays single-packet.
    let handler = |req: &mut fabrpc::ReqHandle<'_>| {
        let data = req.req_data();
        let mut resp = Vec::new();
        resp.extend_from_slice(&(data.len() as u64).to_le_bytes());
        resp.push(*data.last().unwrap());
        req.respond(&resp).unwrap();
    };
    reg_b
        .register_req_handler(3, ReqFuncType::Foreground, handler)
        .unwrap();
    reg_a
        .register_req_handler(3, ReqFuncType::Foreground, handler)
        .unwrap();

    let client = TestEndpoint::new(&fabric, &reg_a, 0, RpcConfig::default());
    let server = TestEndpoint::new(&fabric, &reg_b, 7, RpcConfig::default());
    let session = connect(&client, &server);

    let mut req = client.rpc.alloc_msg_buffer(MAX_MSG_SIZE);
    assert!(req.is_valid());
    assert_eq!(req.num_pkts(), MAX_MSG_SIZE / 1024);
    req.data_mut()[MAX_MSG_SIZE - 1] = 0x5A;

    let got: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let got_c = got.clone();
    client
        .rpc
        .enqueue_request(
            session,
            3,
            req,
            move |_req_buf, resp, _| *got_c.lock().unwrap() = Some(resp.to_vec()),
            0,
        )
        .unwrap();

    // 8192 request packets at 8 per TX flush.
    for _ in 0..4000 {
        client.rpc.run_event_loop_one();
        server.rpc.run_event_loop_one();
        if got.lock().unwrap().is_some() {
            break;
        }
    }
    let resp = got.lock().unwrap().take().expect("response received");
    assert_eq!(&resp[..8], &(MAX_MSG_SIZE as u64).to_le_bytes());
    assert_eq!(resp[8], 0x5A);
}

#[test]
fn test_pipelined_requests_in_order() {
    let (client, server) = echo_pair(0, RpcConfig::default());
    let session = connect(&client, &server);

    let done = Arc::new(Mutex::new(Vec::new()));
    for tag in 0..4u64 {
        let mut req = client.rpc.alloc_msg_buffer(128);
        fill_msgbuf(&mut req, tag as u8);
        let done_c = done.clone();
        client
            .rpc
            .enqueue_request(
                session,
                1,
                req,
                move |_req_buf, resp, tag| {
                    assert_eq!(resp.len(), 128);
                    done_c.lock().unwrap().push(tag);
                },
                tag,
            )
            .unwrap();
    }

    run_both(&client.rpc, &server.rpc, 8);
    assert_eq!(*done.lock().unwrap(), vec![0, 1, 2, 3]);
    assert_eq!(client.rpc.session_credits(session), Some(8));
}

// =============================================================================
// Datapath argument errors and slot exhaustion
// =============================================================================

#[test]
fn test_enqueue_request_arg_errors() {
    let (client, server) = echo_pair(0, RpcConfig::default());
    let session = connect(&client, &server);

    // Invalid buffer.
    let err = client
        .rpc
        .enqueue_request(session, 1, MsgBuffer::invalid(), |_, _, _| {}, 0)
        .unwrap_err();
    assert_eq!(err.0, DatapathError::InvalidMsgBufferArg);

    // Unknown session.
    let req = client.rpc.alloc_msg_buffer(8);
    let err = client
        .rpc
        .enqueue_request(999, 1, req, |_, _, _| {}, 0)
        .unwrap_err();
    assert_eq!(err.0, DatapathError::InvalidSessionArg);
    client.rpc.free_msg_buffer(err.1);

    // Unregistered request type.
    let req = client.rpc.alloc_msg_buffer(8);
    let err = client
        .rpc
        .enqueue_request(session, 200, req, |_, _, _| {}, 0)
        .unwrap_err();
    assert_eq!(err.0, DatapathError::InvalidReqTypeArg);
    client.rpc.free_msg_buffer(err.1);

    // Oversized message.
    let req = client.rpc.alloc_msg_buffer(MAX_MSG_SIZE + 1024);
    assert!(req.is_valid());
    let err = client
        .rpc
        .enqueue_request(session, 1, req, |_, _, _| {}, 0)
        .unwrap_err();
    assert_eq!(err.0, DatapathError::InvalidMsgSizeArg);
    client.rpc.free_msg_buffer(err.1);
}

#[test]
fn test_slot_exhaustion() {
    let (client, server) = echo_pair(0, RpcConfig::default());
    let session = connect(&client, &server);

    // Fill every slot without running the event loop.
    let done = Arc::new(Mutex::new(0usize));
    for _ in 0..SESSION_REQ_WINDOW {
        let req = client.rpc.alloc_msg_buffer(16);
        let done_c = done.clone();
        client
            .rpc
            .enqueue_request(
                session,
                1,
                req,
                move |_, _, _| *done_c.lock().unwrap() += 1,
                0,
            )
            .unwrap();
    }

    // One more than the window fails.
    let req = client.rpc.alloc_msg_buffer(16);
    let err = client
        .rpc
        .enqueue_request(session, 1, req, |_, _, _| {}, 0)
        .unwrap_err();
    assert_eq!(err.0, DatapathError::NoSessionMsgSlots);
    client.rpc.free_msg_buffer(err.1);

    // Draining the window completes all of them and frees the slots.
    run_both(&client.rpc, &server.rpc, 8);
    assert_eq!(*done.lock().unwrap(), SESSION_REQ_WINDOW);

    let req = client.rpc.alloc_msg_buffer(16);
    client
        .rpc
        .enqueue_request(session, 1, req, |_, _, _| {}, 0)
        .unwrap();
    run_both(&client.rpc, &server.rpc, 4);
}

// =============================================================================
// Background execution and credit returns
// =============================================================================

#[test]
fn test_background_handler_roundtrip() {
    let (client, server) = echo_pair(1, RpcConfig::default());
    let session = connect(&client, &server);

    let mut req = client.rpc.alloc_msg_buffer(256);
    fill_msgbuf(&mut req, 5);
    let expected = req.data().to_vec();

    let got: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let got_c = got.clone();
    client
        .rpc
        .enqueue_request(
            session,
            1,
            req,
            move |_req_buf, resp, _| *got_c.lock().unwrap() = Some(resp.to_vec()),
            0,
        )
        .unwrap();

    // The worker needs wall time; poll until the continuation fires.
    for _ in 0..200 {
        run_both(&client.rpc, &server.rpc, 1);
        if got.lock().unwrap().is_some() {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(got.lock().unwrap().as_deref(), Some(expected.as_slice()));
}

#[test]
fn test_explicit_credit_return_on_window_exhaustion() {
    // A one-packet unexpected window and a background handler: the server
    // must return credit explicitly before the (slow) response ships.
    let config = RpcConfig::default().with_unexp_pkt_window(1);
    let (client, server) = echo_pair(1, config);
    let session = connect(&client, &server);

    let mut req = client.rpc.alloc_msg_buffer(32);
    fill_msgbuf(&mut req, 1);

    let got = Arc::new(Mutex::new(false));
    let got_c = got.clone();
    client
        .rpc
        .enqueue_request(session, 1, req, move |_, _, _| *got_c.lock().unwrap() = true, 0)
        .unwrap();

    for _ in 0..200 {
        run_both(&client.rpc, &server.rpc, 1);
        if *got.lock().unwrap() {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    assert!(*got.lock().unwrap());
    assert_eq!(client.rpc.session_credits(session), Some(8));
    // The explicit return restored the server's one-packet window.
    assert_eq!(server.rpc.unexp_credits(), 1);
}

// =============================================================================
// Fault injection
// =============================================================================

#[test]
fn test_fault_drop_tx_remote() {
    let (client, server) = echo_pair(0, RpcConfig::default());
    let session = connect(&client, &server);

    // Tell the server to drop its datapath TX: requests arrive and the
    // handler runs, but no response ever reaches the client.
    client.rpc.fault_inject_drop_tx_remote(session).unwrap();
    run_both(&client.rpc, &server.rpc, 2);

    let done = Arc::new(Mutex::new(false));
    let done_c = done.clone();
    let req = client.rpc.alloc_msg_buffer(16);
    client
        .rpc
        .enqueue_request(session, 1, req, move |_, _, _| *done_c.lock().unwrap() = true, 0)
        .unwrap();

    run_both(&client.rpc, &server.rpc, 10);
    assert!(!*done.lock().unwrap());
}
