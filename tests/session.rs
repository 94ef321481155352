//! End-to-end tests over real sockets.
//!
//! Each test boots an in-process server on an ephemeral port and drives
//! it with blocking IRC clients:
//!
//! - registration handshake (with and without a server password)
//! - channel flows: JOIN/332/353/366, PART, TOPIC, sender-excluded PRIVMSG
//! - queries: NAMES, LIST, WHOIS, MODE, PING, MOTD
//! - virtual participants conversing with TCP clients on one channel

use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use cove::irc::SharedState;
use cove::{Config, Server};
use tokio::sync::mpsc::UnboundedReceiver;

/// An in-process server plus the state handle for mounting virtual users.
struct TestServer {
    addr: SocketAddr,
    state: SharedState,
}

fn start_server(config: Config) -> TestServer {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async move {
            let server = Server::bind(config).expect("bind");
            let addr = server.local_addr().expect("local addr");
            tx.send((addr, server.state())).expect("handshake");
            let _ = server.run().await;
        });
    });
    let (addr, state) = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("server did not come up");
    TestServer { addr, state }
}

fn test_config() -> Config {
    Config {
        port: 0,
        hostname: "cove.test".into(),
        ..Config::default()
    }
}

/// Simple blocking IRC client for testing.
struct TestClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    lines: Vec<String>,
}

impl TestClient {
    /// Connect without registering.
    fn connect_raw(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(5))?;
        stream.set_read_timeout(Some(Duration::from_secs(2)))?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
            lines: Vec::new(),
        })
    }

    /// Connect and complete the NICK/USER handshake, reading through the
    /// end of the greeting (376 with a MOTD, 422 without).
    fn connect(addr: SocketAddr, nick: &str) -> io::Result<Self> {
        let mut client = Self::connect_raw(addr)?;
        client.send(&format!("NICK {nick}"))?;
        client.send(&format!("USER {nick} 0 * :{nick} test"))?;
        client.read_until_any(&["376", "422"])?;
        Ok(client)
    }

    fn send(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.writer, "{line}\r")?;
        self.writer.flush()
    }

    fn read_line(&mut self) -> io::Result<String> {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed",
            )),
            Ok(_) => {
                let trimmed = line.trim_end().to_string();
                self.lines.push(trimmed.clone());
                Ok(trimmed)
            }
            Err(e) => Err(e),
        }
    }

    /// Read lines until one contains `marker`; returns that line.
    fn read_until(&mut self, marker: &str) -> io::Result<String> {
        self.read_until_any(&[marker])
    }

    fn read_until_any(&mut self, markers: &[&str]) -> io::Result<String> {
        loop {
            let line = self.read_line().map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("waiting for {markers:?}, saw {:?}: {e}", self.lines),
                )
            })?;
            if markers.iter().any(|m| line.contains(m)) {
                return Ok(line);
            }
        }
    }

    /// Assert nothing arrives for a moment (e.g. the sender of a channel
    /// message must not hear it back).
    fn expect_silence(&mut self) {
        self.reader
            .get_ref()
            .set_read_timeout(Some(Duration::from_millis(300)))
            .expect("set timeout");
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => {}
            Ok(_) => panic!("expected silence, got {:?}", line.trim_end()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => panic!("read failed: {e}"),
        }
        self.reader
            .get_ref()
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("reset timeout");
    }
}

/// Wait for a mailbox delivery from the server's runtime thread.
fn recv_timeout(
    rx: &mut UnboundedReceiver<cove::irc::Message>,
    timeout: Duration,
) -> Option<cove::irc::Message> {
    let deadline = Instant::now() + timeout;
    loop {
        match rx.try_recv() {
            Ok(msg) => return Some(msg),
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(10))
            }
            Err(_) => return None,
        }
    }
}

// ── Registration ─────────────────────────────────────────────────

#[test]
fn registration_greeting() {
    let server = start_server(test_config());
    let client = TestClient::connect(server.addr, "wren").expect("register");

    let greeting = client.lines.join("\n");
    for numeric in ["001", "002", "003", "004", "422"] {
        assert!(
            greeting.contains(&format!(" {numeric} ")),
            "missing {numeric} in {greeting}"
        );
    }
    assert!(greeting.contains("Welcome to cove.test, wren!~wren@"));
}

#[test]
fn commands_before_registration_are_dropped() {
    let server = start_server(test_config());
    let mut client = TestClient::connect_raw(server.addr).expect("connect");

    client.send("JOIN #early").expect("send");
    client.send("LIST").expect("send");
    client.expect_silence();

    // The gate opens once the handshake completes.
    client.send("NICK late").expect("send");
    client.send("USER late 0 * :Late One").expect("send");
    client.read_until("422").expect("greeting");
}

#[test]
fn server_password_gates_registration() {
    let mut config = test_config();
    config.password = Some("sesame".into());
    let server = start_server(config);

    let mut client = TestClient::connect_raw(server.addr).expect("connect");
    client.send("NICK wren").expect("send");
    client.send("USER wren 0 * :Wren").expect("send");
    client.expect_silence(); // held until PASS arrives

    client.send("PASS sesame").expect("send");
    client.read_until("001").expect("welcome");
}

#[test]
fn motd_file_is_streamed() {
    let dir = std::env::temp_dir().join("cove-session-motd");
    std::fs::create_dir_all(&dir).expect("tmp dir");
    let path = dir.join("motd.txt");
    std::fs::write(&path, "ahoy from the cove\n").expect("write motd");

    let mut config = test_config();
    config.motd = Some(path);
    let server = start_server(config);

    let mut client = TestClient::connect(server.addr, "wren").expect("register");
    let greeting = client.lines.join("\n");
    assert!(greeting.contains(" 375 "));
    assert!(greeting.contains("ahoy from the cove"));

    client.send("MOTD").expect("send");
    client.read_until("376").expect("motd end");
}

// ── Channel flows ────────────────────────────────────────────────

#[test]
fn join_sequence_and_names() {
    let server = start_server(test_config());
    let mut client = TestClient::connect(server.addr, "alpha").expect("register");

    client.send("JOIN #hanabi").expect("send");
    let join = client.read_until("JOIN").expect("join echo");
    assert!(join.contains(":alpha!~alpha@"));
    assert!(join.contains("#hanabi"));
    let topic = client.read_until(" 332 ").expect("topic");
    assert!(topic.ends_with(':'), "empty topic expected: {topic}");
    let names = client.read_until(" 353 ").expect("names");
    assert!(names.ends_with(":alpha"));
    client.read_until(" 366 ").expect("end of names");

    client.send("NAMES #hanabi").expect("send");
    let names = client.read_until(" 353 ").expect("names");
    assert!(names.contains("alpha"));
    client.read_until(" 366 ").expect("end of names");
}

#[test]
fn channel_privmsg_excludes_sender() {
    let server = start_server(test_config());
    let mut alpha = TestClient::connect(server.addr, "alpha").expect("alpha");
    let mut beta = TestClient::connect(server.addr, "beta").expect("beta");

    alpha.send("JOIN #x").expect("send");
    alpha.read_until(" 366 ").expect("alpha joined");
    beta.send("JOIN #x").expect("send");
    beta.read_until(" 366 ").expect("beta joined");
    alpha.read_until("JOIN").expect("saw beta join");

    alpha.send("PRIVMSG #x :hi room").expect("send");
    let got = beta.read_until("PRIVMSG").expect("delivery");
    assert!(got.contains(":alpha!~alpha@"));
    assert!(got.ends_with(":hi room"));
    alpha.expect_silence();
}

#[test]
fn direct_privmsg_and_unknown_target() {
    let server = start_server(test_config());
    let mut alpha = TestClient::connect(server.addr, "alpha").expect("alpha");
    let mut beta = TestClient::connect(server.addr, "beta").expect("beta");

    alpha.send("PRIVMSG beta :psst").expect("send");
    let got = beta.read_until("PRIVMSG").expect("delivery");
    assert!(got.ends_with(":psst"));

    alpha.send("PRIVMSG nobody :hello?").expect("send");
    alpha.read_until(" 401 ").expect("no such nick");
}

#[test]
fn part_notifies_both_sides() {
    let server = start_server(test_config());
    let mut beta = TestClient::connect(server.addr, "beta").expect("beta");
    let mut gamma = TestClient::connect(server.addr, "gamma").expect("gamma");

    beta.send("JOIN #greek").expect("send");
    beta.read_until(" 366 ").expect("beta joined");
    gamma.send("JOIN #greek").expect("send");
    gamma.read_until(" 366 ").expect("gamma joined");
    beta.read_until("JOIN").expect("saw gamma join");

    beta.send("PART #greek :bye").expect("send");
    let ours = beta.read_until("PART").expect("own part");
    assert!(ours.contains(":beta!~beta@"));
    assert!(ours.ends_with(":bye"));
    let theirs = gamma.read_until("PART").expect("peer part");
    assert!(theirs.ends_with(":bye"));

    // Membership is gone: another PART is 442.
    beta.send("PART #greek").expect("send");
    beta.read_until_any(&[" 442 ", " 403 "]).expect("rejected");
}

#[test]
fn topic_set_and_query() {
    let server = start_server(test_config());
    let mut alpha = TestClient::connect(server.addr, "alpha").expect("alpha");
    let mut beta = TestClient::connect(server.addr, "beta").expect("beta");

    alpha.send("JOIN #hanabi").expect("send");
    alpha.read_until(" 366 ").expect("joined");
    beta.send("JOIN #hanabi").expect("send");
    beta.read_until(" 366 ").expect("joined");

    alpha.send("TOPIC #hanabi :fireworks tonight").expect("send");
    let change = beta.read_until("TOPIC").expect("topic change");
    assert!(change.ends_with(":fireworks tonight"));

    beta.send("TOPIC #hanabi").expect("send");
    let topic = beta.read_until(" 332 ").expect("topic reply");
    assert!(topic.ends_with(":fireworks tonight"));

    // Non-members may not touch it.
    let mut gamma = TestClient::connect(server.addr, "gamma").expect("gamma");
    gamma.send("TOPIC #hanabi :hijack").expect("send");
    gamma.read_until(" 442 ").expect("not on channel");
}

#[test]
fn list_shows_channels() {
    let server = start_server(test_config());
    let mut alpha = TestClient::connect(server.addr, "alpha").expect("alpha");
    alpha.send("JOIN #hanabi").expect("send");
    alpha.read_until(" 366 ").expect("joined");

    alpha.send("LIST").expect("send");
    alpha.read_until(" 321 ").expect("header");
    let entry = alpha.read_until(" 322 ").expect("entry");
    assert!(entry.contains("#hanabi 1"));
    alpha.read_until(" 323 ").expect("footer");

    alpha.send("LIST #hanabi,#nowhere").expect("send");
    alpha.read_until(" 322 ").expect("known entry");
    alpha.read_until(" 401 ").expect("unknown name");
    alpha.read_until(" 323 ").expect("footer");
}

// ── Queries ──────────────────────────────────────────────────────

#[test]
fn whois_mode_and_ping() {
    let server = start_server(test_config());
    let mut alpha = TestClient::connect(server.addr, "alpha").expect("alpha");
    let _beta = TestClient::connect(server.addr, "beta").expect("beta");

    alpha.send("WHOIS beta").expect("send");
    let who = alpha.read_until(" 311 ").expect("whois user");
    assert!(who.contains("beta ~beta"));
    alpha.read_until(" 318 ").expect("end of whois");

    alpha.send("WHOIS ghost").expect("send");
    alpha.read_until(" 401 ").expect("no such nick");

    alpha.send("MODE alpha +r").expect("send");
    alpha.send("MODE alpha").expect("send");
    let modes = alpha.read_until(" 221 ").expect("umodeis");
    assert!(modes.ends_with(":+r"));

    // Querying another user's modes is fine; changing them is not.
    alpha.send("MODE beta").expect("send");
    let peer_modes = alpha.read_until(" 221 ").expect("peer umodeis");
    assert!(peer_modes.ends_with(":+"));
    alpha.send("MODE beta +r").expect("send");
    alpha.read_until(" 502 ").expect("usersdontmatch");

    alpha.send("PING 9999").expect("send");
    let pong = alpha.read_until("PONG").expect("pong");
    assert!(pong.contains("alpha!~alpha@"));
    assert!(pong.ends_with(":9999"));
}

#[test]
fn nick_collision_and_rename() {
    let server = start_server(test_config());
    let mut alpha = TestClient::connect(server.addr, "alpha").expect("alpha");
    let mut beta = TestClient::connect(server.addr, "beta").expect("beta");

    alpha.send("NICK beta").expect("send");
    alpha.read_until(" 433 ").expect("collision");

    // A clean rename notifies channel peers with the old nick as prefix.
    alpha.send("JOIN #x").expect("send");
    alpha.read_until(" 366 ").expect("joined");
    beta.send("JOIN #x").expect("send");
    beta.read_until(" 366 ").expect("joined");

    alpha.send("NICK omega").expect("send");
    let note = beta.read_until("NICK").expect("rename note");
    assert!(note.starts_with(":alpha "));
    assert!(note.contains("omega"));
}

#[test]
fn quit_cleans_up() {
    let server = start_server(test_config());
    let mut alpha = TestClient::connect(server.addr, "alpha").expect("alpha");
    let mut beta = TestClient::connect(server.addr, "beta").expect("beta");

    alpha.send("JOIN #x").expect("send");
    alpha.read_until(" 366 ").expect("joined");
    beta.send("JOIN #x").expect("send");
    beta.read_until(" 366 ").expect("joined");
    alpha.read_until("JOIN").expect("saw beta");

    alpha.send("QUIT :gone fishing").expect("send");
    let part = beta.read_until("PART").expect("departure");
    assert!(part.ends_with(":gone fishing"));

    beta.send("WHOIS alpha").expect("send");
    beta.read_until(" 401 ").expect("alpha is gone");
}

// ── Virtual participants ─────────────────────────────────────────

#[test]
fn virtual_user_converses_with_tcp_client() {
    let server = start_server(test_config());
    let (mbox, mut inbox) = tokio::sync::mpsc::unbounded_channel();
    server
        .state
        .register_virtual("helper", "helper", "helper", "Helper Bot", "cove.test", mbox)
        .expect("register virtual");
    server
        .state
        .join(&"helper".into(), "#lobby")
        .expect("helper joins");

    let mut client = TestClient::connect(server.addr, "wren").expect("register");
    client.send("JOIN #lobby").expect("send");
    let names = client.read_until(" 353 ").expect("names");
    assert!(names.contains("helper"), "bot missing from {names}");

    // TCP → virtual: the bot's mailbox sees the JOIN and the message.
    client.send("PRIVMSG #lobby :hello bot").expect("send");
    let mut saw_privmsg = false;
    while let Some(msg) = recv_timeout(&mut inbox, Duration::from_secs(2)) {
        if msg.command == "PRIVMSG" {
            assert_eq!(msg.trailing.as_deref(), Some("hello bot"));
            saw_privmsg = true;
            break;
        }
    }
    assert!(saw_privmsg, "bot never heard the channel message");

    // Virtual → TCP.
    server
        .state
        .privmsg(&"helper".into(), "#lobby", "hello human")
        .expect("bot speaks");
    let got = client.read_until("PRIVMSG").expect("delivery");
    assert!(got.contains(":helper!~helper@"));
    assert!(got.ends_with(":hello human"));

    // Unregistering behaves like QUIT.
    server
        .state
        .unregister(&"helper".into(), "maintenance")
        .expect("unregister");
    let part = client.read_until("PART").expect("bot departure");
    assert!(part.ends_with(":maintenance"));
}
