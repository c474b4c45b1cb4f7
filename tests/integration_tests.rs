// Integration tests for the ferry relay and chat peers
// These tests run a real relay on loopback and drive raw frame clients and full sessions against it

use ferry::{
    cryptography::{open, seal, KeyPair},
    frame::Frame,
    networking::{split_framed, FrameSink, FrameStream},
    relay_utils::serve,
    session::{Session, SessionEvent},
    ChatError, CLOSE_COMMAND,
};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

async fn start_relay() -> (SocketAddr, JoinHandle<Result<(), ChatError>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (addr, tokio::spawn(serve(listener)))
}

async fn raw_client(addr: SocketAddr) -> (FrameStream, FrameSink) {
    split_framed(TcpStream::connect(addr).await.unwrap())
}

/// Give the relay time to register freshly accepted connections.
async fn settle() {
    sleep(Duration::from_millis(100)).await;
}

async fn next_frame(reader: &mut FrameStream) -> Frame {
    timeout(WAIT, reader.next())
        .await
        .expect("timed out waiting for frame")
        .expect("connection closed")
        .expect("malformed frame")
}

async fn assert_silent(reader: &mut FrameStream) {
    assert!(
        timeout(QUIET, reader.next()).await.is_err(),
        "expected no frame to arrive"
    );
}

// ============================================================================
// Relay Fan-out Tests
// ============================================================================

#[tokio::test]
async fn test_relay_forwards_to_all_but_sender() {
    let (addr, _relay) = start_relay().await;
    let (mut x_reader, mut x_writer) = raw_client(addr).await;
    let (mut y_reader, _y_writer) = raw_client(addr).await;
    let (mut z_reader, _z_writer) = raw_client(addr).await;
    settle().await;

    let frame = Frame::chat(vec![0x42; 48]).unwrap();
    x_writer.send(frame.clone()).await.unwrap();

    assert_eq!(next_frame(&mut y_reader).await, frame);
    assert_eq!(next_frame(&mut z_reader).await, frame);
    assert_silent(&mut x_reader).await;
}

#[tokio::test]
async fn test_relay_preserves_order_from_one_source() {
    let (addr, _relay) = start_relay().await;
    let (_x_reader, mut x_writer) = raw_client(addr).await;
    let (mut y_reader, _y_writer) = raw_client(addr).await;
    settle().await;

    let frames: Vec<Frame> = (0u8..20)
        .map(|i| Frame::chat(vec![i; 32 + i as usize]).unwrap())
        .collect();
    for frame in &frames {
        x_writer.send(frame.clone()).await.unwrap();
    }

    for expected in &frames {
        assert_eq!(&next_frame(&mut y_reader).await, expected);
    }
}

#[tokio::test]
async fn test_relay_reassembles_split_writes() {
    let (addr, _relay) = start_relay().await;
    let mut x_stream = TcpStream::connect(addr).await.unwrap();
    x_stream.set_nodelay(true).unwrap();
    let (mut y_reader, _y_writer) = raw_client(addr).await;
    settle().await;

    let frame = Frame::chat(vec![0x17; 64]).unwrap();
    let bytes = frame.encode();
    for piece in bytes.chunks(5) {
        x_stream.write_all(piece).await.unwrap();
        x_stream.flush().await.unwrap();
        sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(next_frame(&mut y_reader).await, frame);
}

#[tokio::test]
async fn test_relay_forwards_key_frames_verbatim() {
    let (addr, _relay) = start_relay().await;
    let (_x_reader, mut x_writer) = raw_client(addr).await;
    let (mut y_reader, _y_writer) = raw_client(addr).await;
    settle().await;

    let pair = KeyPair::generate();
    x_writer.send(Frame::key_exchange(pair.public_key())).await.unwrap();

    let received = next_frame(&mut y_reader).await;
    assert!(received.is_key());
    assert_eq!(
        received.peer_public_key().unwrap().as_bytes(),
        pair.public_key().as_bytes()
    );
}

// ============================================================================
// Relay Disconnect Tests
// ============================================================================

#[tokio::test]
async fn test_close_frame_is_forwarded_then_sender_removed() {
    let (addr, _relay) = start_relay().await;
    let (mut x_reader, mut x_writer) = raw_client(addr).await;
    let (mut y_reader, mut y_writer) = raw_client(addr).await;
    let (mut z_reader, _z_writer) = raw_client(addr).await;
    settle().await;

    let key = [3u8; 32];
    let close = Frame::close(seal(&key, b"bye").unwrap()).unwrap();
    x_writer.send(close.clone()).await.unwrap();

    let forwarded = next_frame(&mut y_reader).await;
    assert_eq!(forwarded, close);
    assert_eq!(open(&key, forwarded.payload()).unwrap(), b"bye");
    assert_eq!(next_frame(&mut z_reader).await, close);

    // the relay closed X's connection and no longer delivers to it
    let ended = timeout(WAIT, x_reader.next()).await.expect("relay kept X open");
    assert!(!matches!(ended, Some(Ok(_))));

    let after = Frame::chat(vec![1u8; 40]).unwrap();
    y_writer.send(after.clone()).await.unwrap();
    assert_eq!(next_frame(&mut z_reader).await, after);
}

#[tokio::test]
async fn test_frames_after_close_are_not_delivered() {
    let (addr, _relay) = start_relay().await;
    let (_x_reader, mut x_writer) = raw_client(addr).await;
    let (mut y_reader, _y_writer) = raw_client(addr).await;
    let (_z_reader, _z_writer) = raw_client(addr).await;
    settle().await;

    x_writer.send(Frame::close(Vec::new()).unwrap()).await.unwrap();
    // a frame on the same connection right behind the close
    let _ = x_writer.send(Frame::chat(vec![8u8; 40]).unwrap()).await;

    assert!(next_frame(&mut y_reader).await.is_close());
    assert_silent(&mut y_reader).await;
}

#[tokio::test]
async fn test_abrupt_disconnect_produces_close_notice() {
    let (addr, _relay) = start_relay().await;
    let x = raw_client(addr).await;
    let (mut y_reader, _y_writer) = raw_client(addr).await;
    settle().await;

    drop(x);

    let notice = next_frame(&mut y_reader).await;
    assert!(notice.is_close());
    assert!(notice.payload().is_empty());
}

#[tokio::test]
async fn test_malformed_frame_drops_only_that_client() {
    let (addr, _relay) = start_relay().await;
    let mut x_stream = TcpStream::connect(addr).await.unwrap();
    let (mut y_reader, _y_writer) = raw_client(addr).await;
    let (mut z_reader, mut z_writer) = raw_client(addr).await;
    settle().await;

    // close flag byte of 7 is not a valid header
    x_stream.write_all(&[7, 0, 0, 0, 0, 0]).await.unwrap();

    assert!(next_frame(&mut y_reader).await.is_close());
    assert!(next_frame(&mut z_reader).await.is_close());

    let frame = Frame::chat(vec![2u8; 40]).unwrap();
    z_writer.send(frame.clone()).await.unwrap();
    assert_eq!(next_frame(&mut y_reader).await, frame);
}

#[tokio::test]
async fn test_client_that_stops_reading_does_not_stall_relay() {
    let (addr, _relay) = start_relay().await;
    let (mut x_reader, mut x_writer) = raw_client(addr).await;
    // Y never polls its reader
    let (_y_reader, _y_writer) = raw_client(addr).await;
    settle().await;

    // far more than Y's socket buffers and relay queue can hold
    let bulk = Frame::chat(vec![0x5A; 1024 * 1024]).unwrap();
    for _ in 0..64 {
        timeout(WAIT, x_writer.send(bulk.clone()))
            .await
            .expect("relay stopped reading from X")
            .unwrap();
    }

    // the relay still registers newcomers and forwards their frames
    let (_w_reader, mut w_writer) = raw_client(addr).await;
    settle().await;
    let small = Frame::chat(vec![0x01; 40]).unwrap();
    w_writer.send(small.clone()).await.unwrap();

    let mut got_small = false;
    let mut got_notice = false;
    while !(got_small && got_notice) {
        let frame = next_frame(&mut x_reader).await;
        if frame == small {
            got_small = true;
        } else if frame.is_close() && frame.payload().is_empty() {
            got_notice = true;
        }
    }
}

#[tokio::test]
async fn test_relay_exits_when_last_client_leaves() {
    let (addr, relay) = start_relay().await;
    let (_x_reader, mut x_writer) = raw_client(addr).await;
    settle().await;

    x_writer.send(Frame::close(Vec::new()).unwrap()).await.unwrap();

    let result = timeout(WAIT, relay).await.expect("relay did not exit");
    assert!(result.unwrap().is_ok());
}

// ============================================================================
// End-to-End Chat Tests
// ============================================================================

struct Peer {
    input: mpsc::Sender<String>,
    events: mpsc::Receiver<SessionEvent>,
    handle: JoinHandle<Result<(), ChatError>>,
}

async fn join(addr: SocketAddr, name: &str) -> Peer {
    let session = Session::connect(&addr.to_string(), name).await.unwrap();
    let (input_tx, input_rx) = mpsc::channel(16);
    let (events_tx, events_rx) = mpsc::channel(64);
    Peer {
        input: input_tx,
        events: events_rx,
        handle: tokio::spawn(session.run(input_rx, events_tx)),
    }
}

async fn next_event(peer: &mut Peer) -> SessionEvent {
    timeout(WAIT, peer.events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event channel closed")
}

async fn wait_for(peer: &mut Peer, wanted: SessionEvent) {
    loop {
        if next_event(peer).await == wanted {
            return;
        }
    }
}

async fn say(peer: &Peer, text: &str) {
    peer.input.send(text.to_string()).await.unwrap();
}

fn message(sender: &str, text: &str) -> SessionEvent {
    SessionEvent::Message {
        sender: sender.to_string(),
        text: text.to_string(),
    }
}

#[tokio::test]
async fn test_two_peers_chat_through_relay() {
    let (addr, _relay) = start_relay().await;
    let mut alice = join(addr, "alice").await;
    let mut bob = join(addr, "bob").await;

    wait_for(&mut alice, SessionEvent::Joined("bob".to_string())).await;
    wait_for(&mut bob, SessionEvent::Joined("alice".to_string())).await;

    say(&alice, "hello").await;
    assert_eq!(next_event(&mut bob).await, message("alice", "hello"));

    say(&bob, "hi alice").await;
    assert_eq!(next_event(&mut alice).await, message("bob", "hi alice"));
}

#[tokio::test]
async fn test_peer_churn_triggers_new_handshake() {
    let (addr, _relay) = start_relay().await;
    let mut alice = join(addr, "alice").await;
    let mut bob = join(addr, "bob").await;

    wait_for(&mut alice, SessionEvent::Joined("bob".to_string())).await;
    wait_for(&mut bob, SessionEvent::Joined("alice".to_string())).await;

    say(&alice, "hello").await;
    assert_eq!(next_event(&mut bob).await, message("alice", "hello"));

    // bob leaves: alice sees the close frame and goes back to the handshake
    say(&bob, CLOSE_COMMAND).await;
    assert_eq!(
        next_event(&mut alice).await,
        SessionEvent::PeerDisconnected(Some("bob".to_string()))
    );
    wait_for(&mut bob, SessionEvent::Closed).await;
    assert!(bob.handle.await.unwrap().is_ok());

    say(&alice, "anyone there?").await;
    assert_eq!(
        next_event(&mut alice).await,
        SessionEvent::Undelivered("anyone there?".to_string())
    );

    // carol arrives and gets a fresh key with alice
    let mut carol = join(addr, "carol").await;
    assert_eq!(next_event(&mut alice).await, SessionEvent::Keyed);
    assert_eq!(next_event(&mut carol).await, SessionEvent::Keyed);
    wait_for(&mut alice, SessionEvent::Joined("carol".to_string())).await;
    wait_for(&mut carol, SessionEvent::Joined("alice".to_string())).await;

    say(&alice, "welcome").await;
    assert_eq!(next_event(&mut carol).await, message("alice", "welcome"));
}

#[tokio::test]
async fn test_forged_frame_is_a_visible_decryption_failure() {
    let (addr, _relay) = start_relay().await;
    let mut alice = join(addr, "alice").await;
    let mut bob = join(addr, "bob").await;

    wait_for(&mut alice, SessionEvent::Joined("bob".to_string())).await;
    wait_for(&mut bob, SessionEvent::Joined("alice".to_string())).await;

    // an outsider on the relay cannot produce a valid envelope
    let (_mallory_reader, mut mallory_writer) = raw_client(addr).await;
    settle().await;
    let forged = seal(&[0xEE; 32], b"trust me").unwrap();
    mallory_writer.send(Frame::chat(forged).unwrap()).await.unwrap();

    assert_eq!(next_event(&mut alice).await, SessionEvent::DecryptionFailed);
    assert_eq!(next_event(&mut bob).await, SessionEvent::DecryptionFailed);

    // the session keeps working afterwards
    say(&alice, "still here").await;
    assert_eq!(next_event(&mut bob).await, message("alice", "still here"));
}

#[tokio::test]
async fn test_relay_loss_ends_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut alice = join(addr, "alice").await;

    let (stream, _) = listener.accept().await.unwrap();
    drop(stream);
    drop(listener);

    wait_for(&mut alice, SessionEvent::ConnectionLost).await;
    assert_eq!(next_event(&mut alice).await, SessionEvent::Closed);
    assert!(alice.handle.await.unwrap().is_err());
}
