#![allow(dead_code)]
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use crossbeam::channel as chan;

use strand_framer::FrameDecoder;

use strand_net::*;

/// Remembers everything a session asked of it.
#[derive(Default)]
pub struct RecordingTransport {
    wire: Mutex<Vec<u8>>,
    closes: Mutex<Vec<(DisconnectReason, bool)>>,
    failing: AtomicBool,
    gate: Mutex<Option<(chan::Sender<()>, chan::Receiver<()>)>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<RecordingTransport> {
        Default::default()
    }

    /// Make every later transmit fail, as if the peer reset the connection.
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    /// Make the next transmit stall until released.
    ///
    /// Returns a receiver which fires once that transmit has started, and a sender which lets it finish.
    pub fn block_next_transmit(&self) -> (chan::Receiver<()>, chan::Sender<()>) {
        let (entered_tx, entered_rx) = chan::bounded(1);
        let (release_tx, release_rx) = chan::bounded(1);
        *self.gate.lock().unwrap() = Some((entered_tx, release_rx));
        (entered_rx, release_tx)
    }

    pub fn wire(&self) -> Vec<u8> {
        self.wire.lock().unwrap().clone()
    }

    pub fn closes(&self) -> Vec<(DisconnectReason, bool)> {
        self.closes.lock().unwrap().clone()
    }

    /// Decode everything transmitted so far back into messages.
    pub fn sent_messages(&self) -> Vec<GameMessage> {
        let mut decoder = FrameDecoder::new(65536);
        let mut payloads = vec![];
        decoder
            .parse_bytes(&self.wire(), |p| payloads.push(p))
            .unwrap();
        assert_eq!(decoder.buffered_bytes(), 0, "Wire ends mid-frame");
        payloads
            .iter()
            .map(|p| GameCodec.decode(p).unwrap())
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn transmit(&self, data: &[u8]) -> Result<()> {
        let gate = self.gate.lock().unwrap().take();
        if let Some((entered, release)) = gate {
            entered.send(())?;
            release.recv()?;
        }

        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("Connection reset by peer");
        }
        self.wire.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn close(&self, reason: DisconnectReason, notify_peer: bool) {
        self.closes.lock().unwrap().push((reason, notify_peer));
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    pub disconnects: Mutex<Vec<(SessionId, DisconnectReason)>>,
}

impl SessionObserver for RecordingObserver {
    fn disconnected(&self, session: &Session, reason: DisconnectReason) {
        self.disconnects
            .lock()
            .unwrap()
            .push((session.id(), reason));
    }
}

#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum GameKind {
    Login,
    Chat,
    Logout,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GameMessage {
    Login(String),
    Chat(String),
    Logout,
}

/// One kind byte, then UTF-8 text.
pub struct GameCodec;

impl GameCodec {
    pub fn encode(&self, message: &GameMessage) -> Bytes {
        let mut out = BytesMut::new();
        match message {
            GameMessage::Login(name) => {
                out.put_u8(0);
                out.put_slice(name.as_bytes());
            }
            GameMessage::Chat(text) => {
                out.put_u8(1);
                out.put_slice(text.as_bytes());
            }
            GameMessage::Logout => out.put_u8(2),
        }
        out.freeze()
    }
}

impl MessageCodec for GameCodec {
    type Message = GameMessage;
    type Kind = GameKind;

    fn decode(&self, payload: &Bytes) -> Result<GameMessage> {
        let text = || String::from_utf8(payload[1..].to_vec());
        Ok(match payload.first() {
            Some(0) => GameMessage::Login(text()?),
            Some(1) => GameMessage::Chat(text()?),
            Some(2) if payload.len() == 1 => GameMessage::Logout,
            _ => anyhow::bail!("Unrecognized message {:?}", payload),
        })
    }

    fn kind(&self, message: &GameMessage) -> GameKind {
        match message {
            GameMessage::Login(_) => GameKind::Login,
            GameMessage::Chat(_) => GameKind::Chat,
            GameMessage::Logout => GameKind::Logout,
        }
    }
}

/// Frame a message the way a peer would put it on the wire.
pub fn frame(message: &GameMessage) -> Vec<u8> {
    let payload = GameCodec.encode(message);
    let mut out = (payload.len() as u32).to_le_bytes().to_vec();
    out.extend_from_slice(&payload);
    out
}

/// A small chat server: logging in authenticates and says hello, chat is echoed back, logout says goodbye and ends
/// the session gracefully.
pub fn chat_table() -> DispatchTable<GameCodec> {
    let mut table = DispatchTable::new(GameCodec);
    table
        .register_fn(GameKind::Login, false, |session, msg| {
            if let GameMessage::Login(name) = msg {
                session.authenticate(Some(Arc::new(name.clone())))?;
                session.enqueue(GameCodec.encode(&GameMessage::Chat(format!("welcome {}", name))));
            }
            Ok(MessageHandlerOutcome::ContinueHandling)
        })
        .unwrap()
        .register_fn(GameKind::Chat, true, |session, msg| {
            let name = session
                .identity_as::<String>()
                .ok_or_else(|| anyhow::anyhow!("No name"))?;
            if let GameMessage::Chat(text) = msg {
                session.enqueue(GameCodec.encode(&GameMessage::Chat(format!("{}: {}", name, text))));
            }
            Ok(MessageHandlerOutcome::ContinueHandling)
        })
        .unwrap()
        .register_fn(GameKind::Logout, true, |session, _msg| {
            session.enqueue(GameCodec.encode(&GameMessage::Logout));
            Ok(MessageHandlerOutcome::GracefulShutdown)
        })
        .unwrap();
    table
}

pub fn chat_host(config: HostConfig) -> Arc<SessionHost<GameCodec>> {
    SessionHost::new(config, chat_table()).unwrap()
}

/// Open a session on `host` and bring it to [ConnectionState::Connected].
pub fn connect(host: &SessionHost<GameCodec>) -> (Arc<Session>, Arc<RecordingTransport>) {
    let transport = RecordingTransport::new();
    let session = host.open_session(transport.clone()).unwrap();
    host.on_connection_state_changed(session.id(), ConnectionState::Connected)
        .unwrap();
    (session, transport)
}
