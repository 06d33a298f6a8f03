//! Application bootstrap and the interactive input loop.
//!
//! `App` wires configuration into the concrete collaborators (identity key,
//! SQLite store, TCP transport, session registry and router) and runs the
//! listener, the handshake reaper and the stdin command loop together.

use crate::{
    crypto::{AtRestCipher, IdentityKeyPair, LocalIdentity},
    router::{Router, RouterEvent},
    session::{EngineFactory, ProtocolType, SessionRegistry},
    storage::{EncryptedStore, SqliteBackend},
    transport::{tcp, TcpTransport},
    utils::{MessengerConfig, MessengerError, NetworkError, ProtocolError, Result},
};
use chrono::{Duration as ChronoDuration, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// File under `storage.keys_dir` holding the identity secret key
pub const IDENTITY_KEY_FILE: &str = "identity.key";

/// One line of user input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `<peer> <text>`
    Send {
        /// Peer address
        peer: String,
        /// Message text
        text: String,
    },
    /// `/start <peer> [otr|ratchet]`
    Start {
        /// Peer address
        peer: String,
        /// Protocol, or the configured default
        protocol: Option<ProtocolType>,
    },
    /// `/end <peer>`
    End {
        /// Peer address
        peer: String,
    },
    /// `/sessions`
    Sessions,
    /// `/history <peer>`
    History {
        /// Peer address
        peer: String,
    },
    /// `/help`
    Help,
    /// `exit`
    Exit,
}

impl Command {
    /// Parse one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        if line == "exit" {
            return Ok(Some(Self::Exit));
        }

        let mut words = line.split_whitespace();
        let Some(first) = words.next() else {
            return Ok(None);
        };
        let peer = |word: Option<&str>| {
            word.map(str::to_string)
                .ok_or_else(|| invalid_input(format!("{first} needs a peer address")))
        };

        let command = match first {
            "/start" => Self::Start {
                peer: peer(words.next())?,
                protocol: words.next().map(str::parse).transpose()?,
            },
            "/end" => Self::End {
                peer: peer(words.next())?,
            },
            "/sessions" => Self::Sessions,
            "/history" => Self::History {
                peer: peer(words.next())?,
            },
            "/help" => Self::Help,
            other if other.starts_with('/') => {
                return Err(invalid_input(format!("unknown command {other}")));
            }
            address => {
                let text = line[address.len()..].trim_start();
                if text.is_empty() {
                    return Err(invalid_input("usage: <peer> <message>"));
                }
                Self::Send {
                    peer: address.to_string(),
                    text: text.to_string(),
                }
            }
        };
        Ok(Some(command))
    }
}

fn invalid_input<S: Into<String>>(reason: S) -> MessengerError {
    ProtocolError::InvalidMessage {
        reason: reason.into(),
    }
    .into()
}

const HELP: &str = "\
<peer> <message>            send a message
/start <peer> [otr|ratchet]  begin a key exchange
/end <peer>                  end a session
/sessions                    list sessions
/history <peer>              show stored messages
exit                         quit";

/// The assembled messenger node
pub struct App {
    config: MessengerConfig,
    keypair: IdentityKeyPair,
    router: Arc<Router>,
    store: Arc<EncryptedStore>,
    events: mpsc::UnboundedReceiver<RouterEvent>,
}

impl App {
    /// Build every component from `config`. Nothing is bound or spawned yet.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, a bad at-rest key, an unreadable
    /// identity key or an unopenable database
    pub fn new(config: MessengerConfig) -> Result<Self> {
        config.validate()?;
        config.ensure_directories()?;

        let keypair = IdentityKeyPair::load_or_generate(Self::identity_key_path(&config))?;
        let local = LocalIdentity::new(
            config.identity.display_name.clone(),
            config.identity.routing_id.clone(),
            config.identity.address.clone(),
            &keypair,
        );

        let cipher = AtRestCipher::new(
            config.storage.at_rest_key.as_bytes(),
            config.storage.at_rest_scheme,
        )?;
        let backend = Arc::new(SqliteBackend::open(&config.storage.database_file)?);
        let store = Arc::new(EncryptedStore::new(backend, cipher));

        let factory = EngineFactory::new(keypair.clone(), config.session.engine_options());
        let registry = Arc::new(SessionRegistry::new(
            factory,
            config.session.default_protocol,
            config.session.max_sessions,
        ));
        let transport = Arc::new(TcpTransport::new(
            config.network.listen_port,
            Duration::from_secs(config.network.connection_timeout),
        ));

        let (router, events) = Router::new(local, registry, transport, Arc::clone(&store));

        Ok(Self {
            config,
            keypair,
            router: Arc::new(router),
            store,
            events,
        })
    }

    /// Where the identity key lives for `config`
    pub fn identity_key_path(config: &MessengerConfig) -> PathBuf {
        config.storage.keys_dir.join(IDENTITY_KEY_FILE)
    }

    /// The node's router
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// The node's identity key
    pub fn keypair(&self) -> &IdentityKeyPair {
        &self.keypair
    }

    /// Restore saved sessions and apply the retention policy
    pub async fn restore(&self) -> Result<usize> {
        if self.config.storage.retention_days > 0 {
            // Capped at a century so the duration cannot overflow.
            let days = self.config.storage.retention_days.min(36_500);
            let cutoff = Utc::now() - ChronoDuration::days(i64::try_from(days).unwrap_or(36_500));
            self.store.prune_older_than(cutoff)?;
        }
        self.router.restore_sessions().await
    }

    /// Run the node until `exit` or end of input
    pub async fn run(mut self) -> Result<()> {
        let local = self.router.local().clone();
        log::info!("Starting messenger as {local}");
        log::info!("Fingerprint key: {}", hex::encode(self.keypair.public_key_bytes()));

        self.restore().await?;

        let listener = tcp::bind(&self.config.network.bind_address, self.config.network.listen_port).await?;
        log::info!(
            "Listening on {}:{}",
            self.config.network.bind_address,
            self.config.network.listen_port
        );

        let router = Arc::clone(&self.router);
        let mut server = tokio::spawn(tcp::serve(
            listener,
            self.config.network.max_envelope_size,
            move |envelope| {
                let router = Arc::clone(&router);
                async move { router.on_inbound_envelope(envelope).await }
            },
        ));
        let reaper = self
            .router
            .spawn_handshake_reaper(Duration::from_secs(self.config.session.reaper_interval));

        println!("Ready. Type /help for commands.");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let outcome = loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        break Ok(());
                    };
                    match Command::parse(&line) {
                        Ok(Some(Command::Exit)) => break Ok(()),
                        Ok(Some(command)) => {
                            if let Err(e) = self.handle_command(command).await {
                                println!("! {e}");
                            }
                        }
                        Ok(None) => {}
                        Err(e) => println!("! {e}"),
                    }
                }
                Some(event) = self.events.recv() => print_event(&event),
                joined = &mut server => {
                    break match joined {
                        Ok(result) => result,
                        Err(e) => Err(NetworkError::Transport {
                            reason: format!("listener task failed: {e}"),
                        }
                        .into()),
                    };
                }
            }
        };

        reaper.abort();
        server.abort();
        log::info!("Messenger stopped");
        outcome
    }

    /// Execute one parsed command
    pub async fn handle_command(&self, command: Command) -> Result<()> {
        match command {
            Command::Send { peer, text } => {
                let encrypted = match self.router.registry().get(&peer).await {
                    Some(session) => session.lock().await.engine.is_encrypted(),
                    None => false,
                };
                if !encrypted {
                    self.router.start_session(&peer, None).await?;
                    println!("No encrypted session with {peer} yet; key exchange started, send again once it completes");
                    return Ok(());
                }
                self.router.send_application_message(&peer, &text).await?;
            }
            Command::Start { peer, protocol } => {
                self.router.start_session(&peer, protocol).await?;
                println!("Key exchange started with {peer}");
            }
            Command::End { peer } => {
                if self.router.end_session(&peer).await? {
                    println!("Session with {peer} ended");
                } else {
                    println!("No session with {peer}");
                }
            }
            Command::Sessions => {
                let sessions = self.router.list_sessions().await;
                if sessions.is_empty() {
                    println!("No sessions");
                }
                for summary in sessions {
                    let id = summary
                        .session_id
                        .map_or_else(|| "-".to_string(), |id| id.to_string());
                    let fingerprint = summary
                        .fingerprint
                        .map_or_else(|| "-".to_string(), |f| f.to_string());
                    println!(
                        "{:<21} {:<8} {:<18} {id} {fingerprint}",
                        summary.peer.address, summary.protocol, summary.state
                    );
                }
            }
            Command::History { peer } => {
                for message in self.router.history(&peer).await? {
                    println!(
                        "[{}] {:<8} {}",
                        message.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        message.direction,
                        message.text
                    );
                }
            }
            Command::Help => println!("{HELP}"),
            Command::Exit => {}
        }
        Ok(())
    }
}

fn print_event(event: &RouterEvent) {
    match event {
        RouterEvent::HandshakeCompleted {
            peer, fingerprint, ..
        } => println!("* Encrypted session with {} (fingerprint {fingerprint})", peer.label()),
        RouterEvent::MessageReceived { peer, content, .. } => {
            println!("{} > {content}", peer.label());
        }
        RouterEvent::SessionEnded { peer, reason } => {
            println!("* Session with {} ended: {reason}", peer.label());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_send_keeps_message_spacing() {
        let command = Command::parse("10.0.0.2  Want to play  fortnite?").unwrap();
        assert_eq!(
            command,
            Some(Command::Send {
                peer: "10.0.0.2".to_string(),
                text: "Want to play  fortnite?".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("exit").unwrap(), Some(Command::Exit));
        assert_eq!(Command::parse("   ").unwrap(), None);
        assert_eq!(Command::parse("/sessions").unwrap(), Some(Command::Sessions));
        assert_eq!(
            Command::parse("/start 10.0.0.2 ratchet").unwrap(),
            Some(Command::Start {
                peer: "10.0.0.2".to_string(),
                protocol: Some(ProtocolType::DoubleRatchet),
            })
        );
        assert_eq!(
            Command::parse("/start 10.0.0.2").unwrap(),
            Some(Command::Start {
                peer: "10.0.0.2".to_string(),
                protocol: None,
            })
        );
        assert!(Command::parse("/start").is_err());
        assert!(Command::parse("/start 10.0.0.2 pgp").is_err());
        assert!(Command::parse("/bogus").is_err());
        assert!(Command::parse("10.0.0.2").is_err());
    }

    #[tokio::test]
    async fn test_app_builds_from_config() {
        let dir = TempDir::new().unwrap();
        let config = MessengerConfig::default().with_data_dir(dir.path());

        let app = App::new(config.clone()).unwrap();
        assert!(App::identity_key_path(&config).exists());
        assert_eq!(app.restore().await.unwrap(), 0);
        assert!(app.router().list_sessions().await.is_empty());

        let again = App::new(config).unwrap();
        assert_eq!(
            again.keypair().public_key_bytes(),
            app.keypair().public_key_bytes()
        );
    }

    #[test]
    fn test_bad_at_rest_key_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut config = MessengerConfig::default().with_data_dir(dir.path());
        config.storage.at_rest_key = "short".to_string();
        assert!(App::new(config).is_err());
    }
}
